use anyhow::{Context, Result};
use log::info;
use std::env;
use std::io;
use std::sync::Arc;

use quadplay_export::ZipExporter;
use quadplay_server::server::{self, ServerConfig, ServerState};
use quadplay_server::token::{TOKEN_ENV, handoff_path};
use quadplay_server::{Allowlist, InstallUpdater, NativeHost, SessionToken};

use crate::Cli;
use crate::launch::LaunchContext;

/// Entry point of the process started with `--listen-child`. Serves until
/// stdin closes or a `quit` command ends the process.
pub(crate) fn run(cli: &Cli, ctx: &LaunchContext) -> Result<()> {
    let token = env::var(TOKEN_ENV)
        .map(SessionToken::from_string)
        .with_context(|| format!("listener started without {TOKEN_ENV}"))?;
    let allowlist = Allowlist::resolve(&ctx.engine_root, &ctx.project, &ctx.library)?;

    let listener = server::bind_with_handoff(
        server::listen_host(cli.serve),
        ctx.settings.port,
        &handoff_path(&ctx.engine_root),
    )?;
    server::enter_server_root(allowlist.server_root())?;

    let updater = InstallUpdater {
        engine_root: ctx.engine_root.clone(),
        provenance: ctx.provenance,
        release_url: ctx.settings.update_url.clone(),
        entry_point: env::current_exe().ok(),
    };
    let config = ServerConfig {
        allowlist,
        token,
        serve_mode: cli.serve,
        kiosk: cli.kiosk,
        exit_on_quit: true,
    };
    let state = Arc::new(ServerState::new(
        config,
        Arc::new(updater),
        Arc::new(ZipExporter),
        Arc::new(NativeHost::new()),
    ));
    let handle = server::serve(listener, state)?;
    info!("listening on {}", handle.local_addr());

    // The supervisor closes our stdin to ask for a graceful stop.
    let _ = io::copy(&mut io::stdin().lock(), &mut io::sink());
    handle.stop();
    info!("listener stopped");
    Ok(())
}
