pub mod midi;
pub mod series;
