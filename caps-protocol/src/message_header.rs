use const_str::convert_ascii_case;

macro_rules! define_headers {
    ($( $name:ident ),* $(,)?) => {
        $(
            pub const $name: &str = {
                const RAW: &str = stringify!($name);
                const LOWER: &str = convert_ascii_case!(lower, RAW);
                LOWER
            };
        )*
    };
}

define_headers! {
		HELLO,
		AUTH,
		AUTH_OK,
		AUTH_ERROR,
		FRAMEBUFFER_LINK,
		SWAP_BUFFERS,
		FRAME_DONE,
		BUFFER_RELEASE,
		INPUT_EVENT,
		MONITOR_ADDED,
		MONITOR_REMOVED,
		SESSION_CREATE,
		SESSION_CREATED,
		SESSION_READY,
		SESSION_STATE,
		ERROR,
		PING,
		PONG,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct MessageHeader(pub String);
impl<S: Into<String>> From<S> for MessageHeader {
	fn from(value: S) -> Self {
		Self(value.into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn headers_are_lowercase_on_the_wire() {
		assert_eq!(HELLO, "hello");
		assert_eq!(AUTH_OK, "auth_ok");
		assert_eq!(FRAMEBUFFER_LINK, "framebuffer_link");
		assert_eq!(SWAP_BUFFERS, "swap_buffers");
		assert_eq!(FRAME_DONE, "frame_done");
		assert_eq!(BUFFER_RELEASE, "buffer_release");
		assert_eq!(SESSION_CREATED, "session_created");
	}

	#[test]
	fn header_from_str() {
		let header: MessageHeader = "frame_done".into();
		assert_eq!(header.0, FRAME_DONE);
	}
}
