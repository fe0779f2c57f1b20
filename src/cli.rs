use clap::{Parser, Subcommand};

/// tokenpool — fixed-pool token allocation service
#[derive(Parser)]
#[command(name = "tokenpool", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind (overrides TOKENPOOL_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Top the token pool up to its fixed size
    Seed,

    /// Force-release every active token
    Clear,
}
