/// Errors produced while framing, sending, or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
	#[error("peer closed the connection")]
	UnexpectedEof,
	#[error("read would block; no complete frame buffered")]
	WouldBlock,
	#[error("datagram exceeded the receive buffer and was truncated")]
	Truncated,
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("nix error: {0}")]
	Nix(#[from] nix::Error),
	#[error("frame is not valid utf-8: {0}")]
	Utf8(#[from] std::string::FromUtf8Error),
	#[error("json payload error: {0}")]
	Json(#[from] serde_json::Error),
	#[error("invalid payload: {0}")]
	InvalidPayload(String),
	#[error("unexpected trailing data after payload arguments")]
	TrailingData,
	#[error("message header {0:?} requires a payload but none was attached")]
	ExpectedPayload(String),
	#[error("expected exactly {expected} attached file descriptors, got {found}")]
	ExpectedFds { expected: u32, found: u32 },
}
