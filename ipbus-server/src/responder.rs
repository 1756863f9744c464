use futures::{SinkExt, StreamExt};
use ipbus_protocol::{Request, link::LinkEvent, tokio_codec::LinkCodec};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::{
    BusTarget,
    error::{Channel, DispatchError},
};

/// The hardware end of a link: executes every request frame against a [`BusTarget`] and
/// replies on the same link.
///
/// Corrupted bytes are dropped without a reply, the serial adapter times the request out.
pub struct LinkResponder<L, T> {
    link: Framed<L, LinkCodec>,
    target: T,
}

impl<L, T> LinkResponder<L, T>
where
    L: AsyncRead + AsyncWrite + Unpin,
    T: BusTarget,
{
    pub fn new(link: L, target: T) -> Self {
        LinkResponder {
            link: Framed::new(link, LinkCodec::default()),
            target,
        }
    }

    /// Serves requests until the link is closed.
    pub async fn run(mut self) -> Result<(), DispatchError> {
        log::info!("Responding to link requests");
        while let Some(event) = self.link.next().await {
            let frame = match event {
                Ok(LinkEvent::Frame(frame)) => frame,
                Ok(LinkEvent::Corrupted { discarded }) => {
                    log::warn!("Discarded {} corrupted bytes from the link", discarded);
                    continue;
                }
                Ok(LinkEvent::Skipped { discarded }) => {
                    log::debug!("Skipped {} bytes from the link", discarded);
                    continue;
                }
                Err(err) => {
                    log::error!("Reading from the link failed: {}", err);
                    break;
                }
            };
            let request = match Request::try_from(frame) {
                Ok(request) => request,
                Err(err) => {
                    log::warn!("Ignoring invalid request: {}", err);
                    continue;
                }
            };
            log::debug!("Executing transaction {}: {:?}", request.id, request.op.kind());
            log::trace!("Request {:?}", request.op);
            let response = self.target.execute(&request);
            if let Err(err) = self.link.send(response.to_frame()).await {
                log::error!("Writing to the link failed: {}", err);
                break;
            }
        }
        Err(DispatchError::ChannelClosed(Channel::Link))
    }
}

#[cfg(test)]
mod test {
    use ipbus_protocol::{InfoCode, Operation, Response};

    use super::*;
    use crate::memory::{FILL_PATTERN, MemoryTarget};

    #[tokio::test]
    async fn executes_requests_from_link() {
        let (link, hardware) = tokio::io::duplex(4096);
        let responder = tokio::spawn(LinkResponder::new(hardware, MemoryTarget::new(0, 16)).run());
        let mut link = Framed::new(link, LinkCodec::default());

        let write = Request::new(
            1,
            Operation::Write {
                address: 0x8,
                // every byte of the value needs escaping
                data: Box::new([0xbc3c_7dbc]),
            },
        );
        let read = Request::new(2, Operation::Read { address: 0x4, words: 2 });
        let outside = Request::new(3, Operation::Read { address: 0x40, words: 1 });
        for request in [&write, &read, &outside] {
            link.send(request.to_frame()).await.unwrap();
        }

        let mut responses = Vec::new();
        for _ in 0..3 {
            match link.next().await {
                Some(Ok(LinkEvent::Frame(frame))) => {
                    responses.push(Response::try_from(frame).unwrap())
                }
                other => panic!("expected a frame, got {:?}", other),
            }
        }
        assert!(responses[0].is_success());
        assert_eq!(&*responses[1].data, &[FILL_PATTERN, 0xbc3c_7dbc]);
        assert_eq!(responses[2].info, InfoCode::BusErrorRead);

        drop(link);
        assert!(matches!(
            responder.await.unwrap(),
            Err(DispatchError::ChannelClosed(Channel::Link))
        ));
    }
}
