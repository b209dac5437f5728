pub mod connector;
pub mod deci_queue;
pub mod frame_reader;
pub mod link;
