pub mod common;
pub mod slurm;
