//! Client side of the relay: sending messages, rebuilding replies from the
//! stream and keeping a view in step with the mirror.

pub mod api;
pub mod bridge;
pub mod list;
pub mod reassembler;
pub mod session;

pub use self::api::{ ChatApi, ChatTransport, FrameStream };
pub use self::bridge::{ DetailAction, ListAction, ThreadDetailBridge, ThreadListBridge };
pub use self::list::ThreadListView;
pub use self::reassembler::{ Phase, Reassembler, ReassemblyEvent };
pub use self::session::{ ChatSession, SessionOptions };
