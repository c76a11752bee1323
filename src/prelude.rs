//! Prelude (helpful reexports) for this package

pub use crate::{
    core::{
        BufferPolicy,
        Config,
        Timeouts,
    },
    initiator::{
        Initiator,
        PendingReply,
        WriteOptions,
    },
    transport::{
        mock::{
            Mock,
            TargetMemory,
        },
        tcp::SpwTcp,
        Transport,
    },
    Error,
};
pub use rmap::{
    Command,
    Status,
    TargetNode,
};
