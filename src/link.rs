//! Transport boundary. The wireless stack lives outside this crate; the
//! pipeline only needs "is a peer connected" and "send these bytes".

use core::sync::atomic::{AtomicBool, Ordering};

/// The closed set of events the wireless stack can hand us. Peer traffic is
/// accepted but only logged for now; it deliberately does not reach the
/// producers.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent<'a> {
    Connected,
    Disconnected,
    PeerRead,
    PeerWrite(&'a [u8]),
}

// Written only from the transport's callback context, read by the publisher
// path. A single relaxed boolean is all the contract asks for.
static CONNECTED: AtomicBool = AtomicBool::new(false);

/// Single dispatch point for all transport callbacks.
pub fn dispatch(event: LinkEvent<'_>) {
    match event {
        LinkEvent::Connected => {
            CONNECTED.store(true, Ordering::Relaxed);
            info!("peer connected");
        }
        LinkEvent::Disconnected => {
            CONNECTED.store(false, Ordering::Relaxed);
            info!("peer disconnected");
        }
        // Traffic proves a peer is attached, even on stacks that never
        // surface an explicit connect event.
        LinkEvent::PeerRead => {
            CONNECTED.store(true, Ordering::Relaxed);
            debug!("peer read");
        }
        LinkEvent::PeerWrite(data) => {
            CONNECTED.store(true, Ordering::Relaxed);
            debug!("peer wrote {} bytes", data.len());
        }
    }
}

pub fn is_connected() -> bool {
    CONNECTED.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError {
    NotConnected,
    Transport,
}

/// Byte-oriented notify channel to the paired client. Best effort: a failed
/// send is the caller's cue to drop the frame, never to block or retry.
pub trait Link {
    fn is_connected(&self) -> bool;
    async fn send(&mut self, frame: &[u8]) -> Result<(), SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test so nothing else races the process-wide flag.
    #[test]
    fn dispatch_tracks_the_connection_flag() {
        dispatch(LinkEvent::Connected);
        assert!(is_connected());
        dispatch(LinkEvent::Disconnected);
        assert!(!is_connected());

        // Inbound traffic from a stack without a connect event still
        // marks the link up.
        dispatch(LinkEvent::PeerRead);
        assert!(is_connected());
        dispatch(LinkEvent::Disconnected);
        dispatch(LinkEvent::PeerWrite(b"hello"));
        assert!(is_connected());

        dispatch(LinkEvent::Disconnected);
        assert!(!is_connected());
    }
}
