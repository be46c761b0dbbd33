mod retention;

pub use retention::RetentionSweeper;
