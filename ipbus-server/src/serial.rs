//! The serial-facing end of a bridge.
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ipbus_protocol::{
    InfoCode, Request, Response,
    link::{DEFAULT_MAX_FRAME_WORDS, LinkEvent},
    tokio_codec::LinkCodec,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::{Instant, timeout_at},
};
use tokio_util::codec::{Framed, FramedRead, FramedWrite};

use crate::error::{Channel, DispatchError};

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// How long to wait for the hardware to reply to a single request.
    pub link_timeout: Duration,
    pub max_frame_words: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            link_timeout: Duration::from_secs(1),
            max_frame_words: DEFAULT_MAX_FRAME_WORDS,
        }
    }
}

/// Carries requests from the request channel to the hardware link and the hardware's replies
/// back to the response channel.
///
/// Every request fully round-trips the link before the next one is read. When the hardware does
/// not reply in time the adapter answers with a bus timeout; when the reply is corrupted it answers
/// with [`InfoCode::BadHeader`]. A closed channel or link ends the adapter.
pub struct SerialAdapter<R, W, L> {
    requests: FramedRead<R, LinkCodec>,
    responses: FramedWrite<W, LinkCodec>,
    link: Framed<L, LinkCodec>,
    config: AdapterConfig,
}

impl<R, W, L> SerialAdapter<R, W, L>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(requests: R, responses: W, link: L, config: AdapterConfig) -> Self {
        SerialAdapter {
            requests: FramedRead::new(requests, LinkCodec::new(config.max_frame_words)),
            responses: FramedWrite::new(responses, LinkCodec::new(config.max_frame_words)),
            link: Framed::new(link, LinkCodec::new(config.max_frame_words)),
            config,
        }
    }

    /// Runs until a channel or the link is closed.
    ///
    /// # Errors
    ///
    /// Always ends with [`DispatchError::ChannelClosed`] naming the stream that was closed.
    pub async fn run(mut self) -> Result<(), DispatchError> {
        log::info!("Serial adapter running");
        loop {
            let frame = match self.requests.next().await {
                None => return Err(closed(Channel::Request)),
                Some(Err(err)) => {
                    log::debug!("Reading request failed: {}", err);
                    return Err(closed(Channel::Request));
                }
                Some(Ok(LinkEvent::Corrupted { discarded })) => {
                    log::warn!("Discarded {} corrupted bytes on the request channel", discarded);
                    continue;
                }
                Some(Ok(LinkEvent::Skipped { discarded })) => {
                    log::debug!("Skipped {} bytes on the request channel", discarded);
                    continue;
                }
                Some(Ok(LinkEvent::Frame(frame))) => frame,
            };
            let request = match Request::try_from(frame) {
                Ok(request) => request,
                Err(err) => {
                    log::warn!("Ignoring invalid request: {}", err);
                    continue;
                }
            };
            log::debug!("Sending transaction {} to the link", request.id);
            let response = self.round_trip(&request).await?;
            if let Err(err) = self.responses.send(response.to_frame()).await {
                log::debug!("Writing response failed: {}", err);
                return Err(closed(Channel::Response));
            }
        }
    }

    async fn round_trip(&mut self, request: &Request) -> Result<Response, DispatchError> {
        if let Err(err) = self.link.send(request.to_frame()).await {
            log::debug!("Writing to the link failed: {}", err);
            return Err(closed(Channel::Link));
        }
        let deadline = Instant::now() + self.config.link_timeout;
        loop {
            let event = match timeout_at(deadline, self.link.next()).await {
                Err(_) => {
                    log::error!("Hardware did not reply to transaction {}", request.id);
                    return Ok(Response::error(request, request.op.kind().bus_timeout()));
                }
                Ok(None) => return Err(closed(Channel::Link)),
                Ok(Some(Err(err))) => {
                    log::debug!("Reading from the link failed: {}", err);
                    return Err(closed(Channel::Link));
                }
                Ok(Some(Ok(event))) => event,
            };
            match event {
                LinkEvent::Corrupted { discarded } => {
                    log::warn!(
                        "Discarded {} corrupted bytes from the link, failing transaction {}",
                        discarded,
                        request.id
                    );
                    return Ok(Response::error(request, InfoCode::BadHeader));
                }
                LinkEvent::Skipped { discarded } => {
                    log::debug!("Skipped {} bytes from the link", discarded);
                }
                LinkEvent::Frame(frame) => match Response::try_from(frame) {
                    Ok(response) if response.id == request.id => {
                        log::trace!("Hardware replied {:?}", response);
                        return Ok(response);
                    }
                    Ok(response) => {
                        log::debug!("Discarding stale reply {} from the link", response.id);
                    }
                    Err(err) => {
                        log::warn!("Discarding invalid reply from the link: {}", err);
                    }
                },
            }
        }
    }
}

fn closed(channel: Channel) -> DispatchError {
    log::error!("The {} is closed, stopping the serial adapter", channel);
    DispatchError::ChannelClosed(channel)
}
