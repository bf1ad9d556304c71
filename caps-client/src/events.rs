use caps_protocol::{InputEvent, MonitorInfo, SessionInfo};

/// Decoded compositor notifications, popped with
/// [`CapsClient::next_event`](crate::CapsClient::next_event) in arrival order.
///
/// Frame completions appear here; buffer releases do not, they only replenish
/// the swapchain behind [`acquire_frame`](crate::CapsClient::acquire_frame).
#[derive(Debug, Clone, PartialEq)]
pub enum CapsEvent {
	/// The compositor finished presenting the last submitted frame and the
	/// monitor accepts a new `swap_buffers`.
	FrameDone { monitor_id: String },
	MonitorAdded(MonitorInfo),
	MonitorRemoved { monitor_id: String },
	/// Lifecycle or metadata change for some session, not necessarily ours.
	SessionState(SessionInfo),
	Input(InputEvent),
	/// Reply to [`create_session`](crate::CapsClient::create_session): the
	/// token a newly spawned client must authenticate with.
	SessionCreated { token: String },
}
