#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tun error: {0}")]
    TunError(#[from] tidy_tuntap::error::Error),

    #[error("port {0} has been unexpectedly closed")]
    PortClosed(u16),

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("stream for {0:?} is closed")]
    StreamClosed(crate::tcp::Dual),

    #[error("no route to {0}:{1}")]
    NoRoute(std::net::Ipv4Addr, u16),
}
