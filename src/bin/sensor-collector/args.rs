use std::path::PathBuf;

use chrono_tz::Tz;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "sensor-collector", version, about)]
pub struct Args {
    /// JSON file with `mac_addresses` and `poll_interval_minutes`
    #[arg(long, env = "SENSOR_COLLECTOR_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:sensor_data.db")]
    pub database_url: String,

    #[arg(long, env = "TZ", default_value = "UTC")]
    pub timezone: Tz,
}
