use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream a connection can run over: plain TCP, a TLS
/// session, or an in-memory pipe in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream, used once a transport may or may not be wrapped in TLS.
pub type BoxedStream = Box<dyn AsyncStream>;
