//! The network-facing end of a bridge.
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ipbus_protocol::{
    InfoCode, Request, Response,
    link::{DEFAULT_MAX_FRAME_WORDS, LinkEvent},
    tokio_codec::LinkCodec,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
    time::{Instant, timeout_at},
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    Dispatch,
    error::{Channel, DispatchError},
};

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// How long to wait for the response to a single request.
    pub response_timeout: Duration,
    pub max_frame_words: usize,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            max_frame_words: DEFAULT_MAX_FRAME_WORDS,
        }
    }
}

struct Link<R, W> {
    requests: FramedWrite<W, LinkCodec>,
    responses: FramedRead<R, LinkCodec>,
    next_id: u16,
    /// Set once a channel is closed. The forwarder never recovers from it.
    closed: Option<Channel>,
}

enum Reply {
    Response(Response),
    TimedOut,
}

impl<R, W> Link<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn link_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = (self.next_id + 1) & 0xfff;
        id
    }

    fn close(&mut self, channel: Channel) -> DispatchError {
        log::error!("The {} is closed, no further requests are forwarded", channel);
        self.closed = Some(channel);
        DispatchError::ChannelClosed(channel)
    }

    /// Sends one request and waits for the reply carrying its link id.
    async fn round_trip(
        &mut self,
        request: &Request,
        response_timeout: Duration,
    ) -> Result<Reply, DispatchError> {
        let id = self.link_id();
        let forwarded = Request::new(id, request.op.clone());
        if let Err(err) = self.requests.send(forwarded.to_frame()).await {
            log::debug!("Writing request failed: {}", err);
            return Err(self.close(Channel::Request));
        }
        let deadline = Instant::now() + response_timeout;
        loop {
            let event = match timeout_at(deadline, self.responses.next()).await {
                Err(_) => return Ok(Reply::TimedOut),
                Ok(None) => return Err(self.close(Channel::Response)),
                Ok(Some(Err(err))) => {
                    log::debug!("Reading response failed: {}", err);
                    return Err(self.close(Channel::Response));
                }
                Ok(Some(Ok(event))) => event,
            };
            let frame = match event {
                LinkEvent::Corrupted { discarded } => {
                    log::warn!(
                        "Discarded {} corrupted bytes while waiting for transaction {}",
                        discarded,
                        request.id
                    );
                    return Ok(Reply::Response(Response::error(
                        request,
                        InfoCode::BadHeader,
                    )));
                }
                LinkEvent::Skipped { discarded } => {
                    log::debug!("Skipped {} bytes on the response channel", discarded);
                    continue;
                }
                LinkEvent::Frame(frame) => frame,
            };
            match Response::try_from(frame) {
                Ok(mut response) if response.id == id => {
                    if response.kind != request.op.kind() || response.words != request.op.words()
                    {
                        log::warn!("Response {:?} does not match its request", response.header());
                        return Ok(Reply::Response(Response::error(
                            request,
                            InfoCode::BadHeader,
                        )));
                    }
                    response.id = request.id;
                    return Ok(Reply::Response(response));
                }
                Ok(response) => {
                    log::debug!("Discarding stale response with link id {}", response.id);
                }
                Err(err) => {
                    log::warn!("Discarding invalid response frame: {}", err);
                }
            }
        }
    }
}

/// Forwards requests over a request channel and collects the replies from a response channel.
///
/// Requests travel as link frames, one at a time: a request is only sent after the reply to the
/// previous one arrived. The whole batch of a client holds the channel pair, so batches of
/// concurrent clients never interleave. Transaction ids are replaced by link-local ids, which
/// lets the forwarder recognise and discard replies that arrive after their request timed out.
///
/// - A corrupted reply fails its transaction with [`InfoCode::BadHeader`], the batch continues.
/// - A missing reply, or a reply reporting a bus timeout, aborts the batch. Every transaction of
///   the batch then reports a bus timeout, including the ones that already completed.
/// - A closed channel fails the batch with [`DispatchError::ChannelClosed`], and every later batch
///   as well.
pub struct Forwarder<R, W> {
    link: Mutex<Link<R, W>>,
    config: ForwardConfig,
}

impl<R, W> Forwarder<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a forwarder reading responses from `responses` and writing requests to `requests`.
    pub fn new(responses: R, requests: W, config: ForwardConfig) -> Forwarder<R, W> {
        Forwarder {
            link: Mutex::new(Link {
                requests: FramedWrite::new(requests, LinkCodec::new(config.max_frame_words)),
                responses: FramedRead::new(responses, LinkCodec::new(config.max_frame_words)),
                next_id: 0,
                closed: None,
            }),
            config,
        }
    }

    pub async fn forward(&self, requests: Vec<Request>) -> Result<Vec<Response>, DispatchError> {
        let mut link = self.link.lock().await;
        if let Some(channel) = link.closed {
            return Err(DispatchError::ChannelClosed(channel));
        }
        let mut responses = Vec::with_capacity(requests.len());
        for request in &requests {
            log::debug!("Forwarding transaction {}: {:?}", request.id, request.op.kind());
            match link.round_trip(request, self.config.response_timeout).await? {
                Reply::Response(response) if !response.info.is_timeout() => {
                    responses.push(response);
                }
                Reply::Response(_) => {
                    log::error!("Transaction {} timed out on the bus, aborting batch", request.id);
                    return Ok(Self::timed_out(&requests));
                }
                Reply::TimedOut => {
                    log::error!(
                        "No response to transaction {} within {:?}, aborting batch",
                        request.id,
                        self.config.response_timeout
                    );
                    return Ok(Self::timed_out(&requests));
                }
            }
        }
        Ok(responses)
    }

    /// Every transaction of an aborted batch reports a bus timeout, including those that
    /// completed before the abort.
    fn timed_out(requests: &[Request]) -> Vec<Response> {
        requests
            .iter()
            .map(|request| Response::error(request, request.op.kind().bus_timeout()))
            .collect()
    }
}

impl<R, W> Dispatch for Forwarder<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn dispatch(
        &self,
        requests: Vec<Request>,
    ) -> impl Future<Output = Result<Vec<Response>, DispatchError>> + Send {
        self.forward(requests)
    }
}

#[cfg(test)]
mod test {
    use ipbus_protocol::Operation;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::channel::{ByteReader, ByteWriter, byte_channel};

    fn read(id: u16) -> Request {
        Request::new(id, Operation::Read { address: 0x4, words: 1 })
    }

    /// The forwarder and the far ends of its channels.
    fn forwarder() -> (
        Forwarder<ByteReader, ByteWriter>,
        FramedRead<ByteReader, LinkCodec>,
        ByteWriter,
    ) {
        let (request_writer, request_reader) = byte_channel(4096);
        let (response_writer, response_reader) = byte_channel(4096);
        let forwarder = Forwarder::new(response_reader, request_writer, ForwardConfig::default());
        (
            forwarder,
            FramedRead::new(request_reader, LinkCodec::default()),
            response_writer,
        )
    }

    async fn next_request(requests: &mut FramedRead<ByteReader, LinkCodec>) -> Request {
        match requests.next().await {
            Some(Ok(LinkEvent::Frame(frame))) => Request::try_from(frame).unwrap(),
            other => panic!("expected a request frame, got {:?}", other),
        }
    }

    async fn reply(writer: &mut ByteWriter, response: Response) {
        let mut bytes = Vec::new();
        ipbus_protocol::link::encode_frame(&response.to_frame(), &mut bytes);
        writer.write_all(&bytes).await.unwrap();
    }

    #[tokio::test]
    async fn responses_keep_client_ids() {
        let (forwarder, mut requests, mut responses) = forwarder();
        let hardware = tokio::spawn(async move {
            for value in [0xaaaa_aaaa, 0xbbbb_bbbb] {
                let request = next_request(&mut requests).await;
                reply(&mut responses, Response::success(&request, Box::new([value]))).await;
            }
        });
        let replies = forwarder.forward(vec![read(100), read(200)]).await.unwrap();
        hardware.await.unwrap();
        assert_eq!(replies[0].id, 100);
        assert_eq!(&*replies[0].data, &[0xaaaa_aaaa]);
        assert_eq!(replies[1].id, 200);
        assert_eq!(&*replies[1].data, &[0xbbbb_bbbb]);
    }

    #[tokio::test]
    async fn corrupted_reply_fails_single_transaction() {
        let (forwarder, mut requests, mut responses) = forwarder();
        let hardware = tokio::spawn(async move {
            let first = next_request(&mut requests).await;
            // a frame cut short by a capture marker
            responses.write_all(&[0xbc, 0x20, 0x00, 0x3c]).await.unwrap();
            // the reply to the first request arrives late
            reply(&mut responses, Response::success(&first, Box::new([1]))).await;
            let second = next_request(&mut requests).await;
            reply(&mut responses, Response::success(&second, Box::new([2]))).await;
        });
        let replies = forwarder.forward(vec![read(1), read(2)]).await.unwrap();
        hardware.await.unwrap();
        assert_eq!(replies[0].info, InfoCode::BadHeader);
        assert!(replies[1].is_success());
        assert_eq!(&*replies[1].data, &[2]);
    }

    #[tokio::test]
    async fn capture_inside_reply_fails_only_its_transaction() {
        let (forwarder, mut requests, mut responses) = forwarder();
        let hardware = tokio::spawn(async move {
            for value in 1..=3 {
                let request = next_request(&mut requests).await;
                let mut bytes = Vec::new();
                let response = Response::success(&request, Box::new([value]));
                ipbus_protocol::link::encode_frame(&response.to_frame(), &mut bytes);
                if value == 1 {
                    bytes[3] = ipbus_protocol::link::CAPTURE;
                }
                responses.write_all(&bytes).await.unwrap();
            }
        });
        let replies = forwarder.forward(vec![read(1), read(2), read(3)]).await.unwrap();
        hardware.await.unwrap();
        assert_eq!(replies[0].info, InfoCode::BadHeader);
        assert!(replies[1].is_success() && replies[2].is_success());
        assert_eq!(&*replies[1].data, &[2]);
        assert_eq!(&*replies[2].data, &[3]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_whole_batch() {
        let (forwarder, mut requests, mut responses) = forwarder();
        let hardware = tokio::spawn(async move {
            let first = next_request(&mut requests).await;
            reply(&mut responses, Response::success(&first, Box::new([1]))).await;
            next_request(&mut requests).await;
            (requests, responses)
        });
        let replies = forwarder.forward(vec![read(1), read(2), read(3)]).await.unwrap();
        let (mut requests, _responses) = hardware.await.unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(
            replies.iter().map(|response| response.id).collect::<Vec<_>>(),
            [1, 2, 3]
        );
        assert!(
            replies
                .iter()
                .all(|response| response.info == InfoCode::BusTimeoutRead)
        );
        // the third request was never sent
        drop(forwarder);
        assert!(requests.next().await.is_none());
    }

    #[tokio::test]
    async fn bus_timeout_reply_aborts_batch() {
        let (forwarder, mut requests, mut responses) = forwarder();
        let hardware = tokio::spawn(async move {
            let first = next_request(&mut requests).await;
            reply(&mut responses, Response::success(&first, Box::new([1]))).await;
            let second = next_request(&mut requests).await;
            reply(&mut responses, Response::error(&second, InfoCode::BusTimeoutRead)).await;
            requests
        });
        let replies = forwarder.forward(vec![read(1), read(2), read(3)]).await.unwrap();
        let mut requests = hardware.await.unwrap();
        assert!(
            replies
                .iter()
                .all(|response| response.info == InfoCode::BusTimeoutRead)
        );
        drop(forwarder);
        assert!(requests.next().await.is_none());
    }

    #[tokio::test]
    async fn closed_channel_poisons_forwarder() {
        let (forwarder, _requests, responses) = forwarder();
        drop(responses);
        assert!(matches!(
            forwarder.forward(vec![read(1)]).await,
            Err(DispatchError::ChannelClosed(Channel::Response))
        ));
        assert!(matches!(
            forwarder.forward(vec![read(2)]).await,
            Err(DispatchError::ChannelClosed(Channel::Response))
        ));
    }
}
