pub mod frame;
pub mod header;
pub mod record;
pub mod sequence;
