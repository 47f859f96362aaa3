use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vidmerge")]
#[command(author, version, about = "Telegram bot that merges your videos into one", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the bot (long polling)
    Run,

    /// Load the configuration, print it with secrets redacted and exit
    CheckConfig,

    /// Print usage statistics from the database without starting the bot
    Stats {
        /// Number of top users to list
        #[arg(short, long, default_value_t = 10)]
        top: usize,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
