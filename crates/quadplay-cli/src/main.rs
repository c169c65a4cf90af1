mod launch;
mod listener;
mod supervisor;

use anyhow::Result;
use clap::Parser;
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;

use quadplay_server::install::lfs_content_missing;

#[derive(Debug, Parser)]
#[command(
    name = "quadplay",
    version,
    about = "Local development server for the quadplay fantasy console"
)]
pub(crate) struct Cli {
    /// Game to load: a directory, a .game.json manifest, or an http:// or
    /// quad:// URL. Loads the default game when omitted.
    #[arg(value_name = "GAMEPATH")]
    gamepath: Option<String>,
    /// Allow devices on the local network to play. Disables editing.
    #[arg(long)]
    serve: bool,
    /// Open in a Chromium app window and stop the server when it closes.
    #[arg(long)]
    nativeapp: bool,
    #[arg(long)]
    quiet: bool,
    /// Directory holding your own games.
    #[arg(long, value_name = "DIR")]
    my_quadplay: Option<String>,
    #[arg(long)]
    no_update_check: bool,
    /// Keep the display awake (attract mode).
    #[arg(long)]
    nosleep: bool,
    /// Full screen without the IDE or other controls.
    #[arg(long)]
    kiosk: bool,
    /// Launch without the IDE.
    #[arg(long)]
    play: bool,
    /// Disable online multiplayer as host and guest.
    #[arg(long)]
    offline: bool,
    #[arg(short = 'p', long)]
    port: Option<u16>,
    /// quadplay installation to serve instead of the one next to this binary.
    #[arg(long, value_name = "DIR")]
    quadpath: Option<PathBuf>,
    /// Launch settings file (JSON).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long, hide = true)]
    listen_child: bool,
}

fn init_logging(quiet: bool) {
    let default_filter = if quiet { "warn" } else { "info" };
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .format_timestamp(None)
    .try_init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = launch::resolve_settings(&cli)?;
    init_logging(settings.quiet);
    let ctx = launch::prepare(&cli, settings)?;

    if cli.listen_child {
        listener::run(&cli, &ctx)?;
        return Ok(ExitCode::SUCCESS);
    }

    if lfs_content_missing(&ctx.engine_root) {
        error!(
            "this development build of quadplay is missing its binary files; install git lfs, then run `git lfs pull` in {}",
            ctx.engine_root.display()
        );
        return Ok(ExitCode::from(2));
    }

    supervisor::run(&cli, &ctx)
}
