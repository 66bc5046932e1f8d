pub mod qoe_table;
pub mod video_table;

pub use qoe_table::write_qoe_table;
pub use video_table::{read_video_table, write_video_table};
