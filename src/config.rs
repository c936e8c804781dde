use std::path::PathBuf;

use clap::Parser;

/// Runtime configuration of the manager node.
#[derive(Parser, Debug, Clone)]
#[command(name = "grid_manager", about = "Manager node of a volunteer-computing grid")]
pub struct ManagerConfig {
    /// Address of the event bus.
    #[arg(long, default_value = "127.0.0.1:6379")]
    pub bus_addr: String,

    /// Directory for shard inputs and collected outputs.
    #[arg(long, default_value = "data")]
    pub work_dir: PathBuf,

    /// Host volunteers fetch shard files from.
    #[arg(long, default_value = "127.0.0.1")]
    pub manager_host: String,

    /// Port of the shard file server.
    #[arg(long, default_value_t = 1010)]
    pub file_port: u16,

    /// Seconds before an unanswered correlated request is dropped.
    #[arg(long, default_value_t = 300)]
    pub pending_request_ttl_secs: u64,

    /// Seconds between expiry sweeps over pending requests.
    #[arg(long, default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Estimated dataset sample size in megabytes, driving shard sizing.
    #[arg(long, default_value_t = 0.5)]
    pub est_sample_size_mb: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bus_addr: "127.0.0.1:6379".to_string(),
            work_dir: PathBuf::from("data"),
            manager_host: "127.0.0.1".to_string(),
            file_port: 1010,
            pending_request_ttl_secs: 300,
            sweep_interval_secs: 30,
            est_sample_size_mb: 0.5,
        }
    }
}
