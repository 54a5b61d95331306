pub mod ask;
pub mod chat;
pub mod episodes;
pub mod init;
pub mod policy;
pub mod stats;
