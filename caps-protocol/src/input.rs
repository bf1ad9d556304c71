//! Input event payloads carried by `input_event` frames.
//!
//! The wire encodes a `kind` discriminant plus kind-specific fields; serde's
//! tagged-enum decode is the demultiplexer. Consumers match exhaustively, so
//! adding a kind is a compile-visible change on both sides.

use serde::{Deserialize, Serialize};

/// One demultiplexed input event. Every kind that originates from a physical
/// device carries the compositor-assigned device id and a monotonic
/// microsecond timestamp; `TouchFrame`/`TouchCancel` are frame delimiters and
/// carry only the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputEvent {
	PointerMotion {
		device: u32,
		time_usec: u64,
		x: f64,
		y: f64,
		// accelerated and unaccelerated deltas travel together; neither is
		// derivable from the other once pointer acceleration ran
		dx: f64,
		dy: f64,
		unaccel_dx: f64,
		unaccel_dy: f64,
	},
	PointerMotionAbsolute {
		device: u32,
		time_usec: u64,
		x: f64,
		y: f64,
		x_transformed: f64,
		y_transformed: f64,
	},
	PointerButton {
		device: u32,
		time_usec: u64,
		button: u32,
		state: ButtonState,
	},
	PointerAxis {
		device: u32,
		time_usec: u64,
		orientation: AxisOrientation,
		delta: f64,
		source: AxisSource,
	},
	PointerAxisDiscrete {
		device: u32,
		time_usec: u64,
		orientation: AxisOrientation,
		delta_discrete: i32,
	},
	PointerAxisStop {
		device: u32,
		time_usec: u64,
		orientation: AxisOrientation,
	},
	Key {
		device: u32,
		time_usec: u64,
		key: u32,
		state: KeyState,
	},
	TouchDown {
		device: u32,
		time_usec: u64,
		contact: TouchContact,
	},
	TouchUp {
		device: u32,
		time_usec: u64,
		contact_id: i32,
	},
	TouchMotion {
		device: u32,
		time_usec: u64,
		contact: TouchContact,
	},
	TouchFrame {
		time_usec: u64,
	},
	TouchCancel {
		time_usec: u64,
	},
	TabletToolProximity {
		device: u32,
		time_usec: u64,
		in_proximity: bool,
		tool: TabletTool,
	},
	TabletToolAxis {
		device: u32,
		time_usec: u64,
		tool: TabletTool,
		axes: TabletToolAxes,
	},
	TabletToolTip {
		device: u32,
		time_usec: u64,
		tool: TabletTool,
		state: TipState,
	},
	TabletToolButton {
		device: u32,
		time_usec: u64,
		tool: TabletTool,
		button: u32,
		state: ButtonState,
	},
	TabletPadButton {
		device: u32,
		time_usec: u64,
		button: u32,
		state: ButtonState,
	},
	TabletPadRing {
		device: u32,
		time_usec: u64,
		ring: u32,
		position: f64,
		source: AxisSource,
	},
	TabletPadStrip {
		device: u32,
		time_usec: u64,
		strip: u32,
		position: f64,
		source: AxisSource,
	},
	SwitchToggle {
		device: u32,
		time_usec: u64,
		switch: SwitchType,
		state: SwitchState,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonState {
	Pressed,
	Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
	Pressed,
	Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TipState {
	Down,
	Up,
}

/// Full contact record for touch down/motion. `x_transformed`/`y_transformed`
/// are the compositor-space coordinates after output transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchContact {
	pub id: i32,
	pub x: f64,
	pub y: f64,
	pub x_transformed: f64,
	pub y_transformed: f64,
}

/// Identity of a physical tablet tool. Echoed unchanged across every
/// proximity/axis/tip/button event of one tool interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletTool {
	pub serial: u64,
	pub tool_type: TabletToolType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletToolType {
	Pen,
	Eraser,
	Brush,
	Pencil,
	Airbrush,
	Finger,
	Mouse,
	Lens,
}

/// Axis snapshot for a tablet tool; axes the tool lacks stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletToolAxes {
	pub x: f64,
	pub y: f64,
	pub pressure: Option<f64>,
	pub distance: Option<f64>,
	pub tilt_x: Option<f64>,
	pub tilt_y: Option<f64>,
	pub rotation: Option<f64>,
	pub slider: Option<f64>,
	pub wheel_delta: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisOrientation {
	Vertical,
	Horizontal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisSource {
	Wheel,
	Finger,
	Continuous,
	WheelTilt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchType {
	Lid,
	TabletMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchState {
	On,
	Off,
}
