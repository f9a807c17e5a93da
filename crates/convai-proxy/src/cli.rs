use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "convai-proxy",
    version,
    about = "WebSocket proxy that keeps the ElevenLabs API key off the client"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "proxy.yaml")]
    pub config: PathBuf,

    /// Port to listen on (overrides config file setting)
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Interface to listen on (overrides config file setting)
    #[arg(long)]
    pub listen_host: Option<String>,

    /// ElevenLabs API key
    #[arg(long, env = "ELEVENLABS_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Signed-URL endpoint (overrides config file setting)
    #[arg(long)]
    pub signed_url_endpoint: Option<String>,
}
