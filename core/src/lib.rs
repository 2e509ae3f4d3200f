pub mod control;
pub mod daemon;
pub mod run;
pub mod scsi;
pub mod types;
pub mod version;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
