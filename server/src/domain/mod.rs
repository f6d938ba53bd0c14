pub mod budget;
pub mod fleet;
pub mod logtail;
pub mod normalize;
