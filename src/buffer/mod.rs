mod live;

pub use live::{FramePacket, LiveOutputs};
