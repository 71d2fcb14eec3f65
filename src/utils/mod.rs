pub mod cache;
pub mod command;
pub mod discovery;
pub mod fastq;
pub mod file;
pub mod naming;
pub mod storage;
pub mod system;
