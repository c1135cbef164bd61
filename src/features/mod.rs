pub mod index;
pub mod packer;
pub mod sampler;
