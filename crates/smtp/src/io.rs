use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Shut the connection down after the final reply.
///
/// This is the only acceptable way to end the exchange after answering a
/// `QUIT` command.
pub async fn bye<S: AsyncWrite + Unpin>(stream: &mut S) -> std::io::Result<()> {
    stream.shutdown().await
}
