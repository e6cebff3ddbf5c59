mod backup;
mod che_cluster;
mod restore;

pub use backup::*;
pub use che_cluster::*;
pub use restore::*;
