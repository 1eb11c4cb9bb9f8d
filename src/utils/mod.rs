pub mod event;
pub mod locks;
pub mod threshold_latch;
