use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use livecache::app::App;
use livecache::cache::EndpointKey;
use livecache::config::Config;
use livecache::logging;
use livecache::message::ChangeKind;

#[derive(Parser, Debug)]
#[command(name = "livecache")]
#[command(about = "Push-invalidated cache for live event snapshots")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/livecache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Keep a scope's endpoints cached while replaying a JSON-lines host feed from stdin
  Watch {
    /// Scope to follow (an event id)
    scope: String,

    /// Endpoint to keep fresh; repeatable (default: the scope's event snapshot)
    #[arg(short, long = "endpoint")]
    endpoints: Vec<String>,

    /// Origin serving the endpoints, overrides the config file
    #[arg(short, long)]
    origin: Option<String>,
  },

  /// Print the endpoints a change kind invalidates
  Keys {
    scope: String,

    /// Change kind, e.g. bid_placed
    change_kind: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Keys { scope, change_kind } => {
      let kind = ChangeKind::parse(&change_kind);
      for key in EndpointKey::for_change(&kind, &scope) {
        println!("{}\t{}", key.path(), key.description());
      }
      Ok(())
    }
    Command::Watch {
      scope,
      endpoints,
      origin,
    } => {
      // Override origin if specified on command line
      let config = if let Some(origin) = origin {
        Config {
          origin: Some(origin),
          ..config
        }
      } else {
        config
      };
      config.validate()?;

      let _guard = logging::init(&config.log)?;

      let mut app = App::new(config, &scope, endpoints)?;
      app.run().await?;

      Ok(())
    }
  }
}
