use clap::{Parser, Subcommand};

/// Metered API gateway with a prepaid credit ledger.
#[derive(Parser)]
#[command(name = "metergate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP gateway
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(long, default_value_t = 8080, env = "PORT")]
        port: u16,
    },

    /// Apply the database schema and seed the product catalogue
    Migrate,
}
