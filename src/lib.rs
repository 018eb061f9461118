//! Reflector Bridge Library
//!
//! Host-side audio bridge sessions with a pacer/mirror dual-stream design
//! that keeps playback position advancing across output device changes.

pub mod audio;
pub mod backend;
pub mod server;
pub mod session;
pub mod shm;
