mod slotmap;

pub use slotmap::{SlotKey, SlotMap};
