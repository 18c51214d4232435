pub use metadata_controller_core as core;
pub use metadata_controller_k8s_api as k8s;
pub use metadata_controller_k8s_index as index;

mod args;

pub use self::args::Args;
