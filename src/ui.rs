// UI layer: interactive menu built on `dialoguer`, progress rendering with
// `indicatif`. Every action delegates to `CloudClient`; this module only
// prompts, renders and reports.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dialoguer::{Confirm, Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthNotice;
use crate::client::CloudClient;
use crate::config::Config;
use crate::upload::UploadEvent;

/// Main interactive menu. Runs until the user chooses "Exit".
pub async fn main_menu(config: Config) -> Result<()> {
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    tokio::spawn(render_notices(notice_rx));
    let client = CloudClient::new(&config, notice_tx)?;

    loop {
        let items = vec![
            "Log in with QR code",
            "Upload file",
            "Session info",
            "Log out",
            "Exit",
        ];
        let selection = Select::new().items(&items).default(0).interact()?;
        match selection {
            0 => handle_login(&client).await?,
            1 => handle_upload(&client).await?,
            2 => handle_session_info(&client).await,
            3 => {
                if Confirm::new().with_prompt("Forget the saved session?").interact()? {
                    client.logout().context("Failed to remove session file")?;
                    println!("Logged out.");
                }
            }
            4 => break,
            _ => {}
        }
    }
    Ok(())
}

/// Cancellation token tripped by Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

async fn handle_login(client: &CloudClient) -> Result<()> {
    println!("Open the link below (or scan it as a QR code) with the campus app. Ctrl-C aborts.");
    let cancel = ctrl_c_token();
    match client.login(&cancel).await {
        Ok(session) => println!("Welcome {}!", session.username),
        Err(e) => println!("Login failed: {}", e),
    }
    cancel.cancel();
    Ok(())
}

async fn handle_upload(client: &CloudClient) -> Result<()> {
    let local: String = Input::new().with_prompt("Local file").interact_text()?;
    let local = PathBuf::from(local);
    let default_remote = local
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| format!("/{}", n))
        .unwrap_or_else(|| "/".into());
    let remote: String = Input::new()
        .with_prompt("Remote path")
        .default(default_remote)
        .interact_text()?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {bytes}/{total_bytes} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let (tx, rx) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(render_upload(bar, rx));

    let cancel = ctrl_c_token();
    let result = client.upload(&local, &remote, &tx, &cancel).await;
    cancel.cancel();
    drop(tx);
    let _ = renderer.await;

    match result {
        Ok(meta) => println!("Uploaded {} ({} bytes)", meta.name, meta.size),
        Err(e) => println!("Upload failed: {}", e),
    }
    Ok(())
}

async fn handle_session_info(client: &CloudClient) {
    let Some(session) = client.store().load() else {
        println!("No saved session. Log in first.");
        return;
    };
    println!("User:       {}", session.username);
    println!("Space:      {}/{}", session.library_id, session.space_id);
    println!("Expires at: {}", session.expires_at);
    match client.check_session().await {
        Ok(true) => println!("Status:     valid"),
        Ok(false) => println!("Status:     expired or revoked"),
        Err(e) => println!("Status:     unknown ({})", e),
    }
}

/// Print handshake notices while a login is in progress.
async fn render_notices(mut notices: mpsc::UnboundedReceiver<AuthNotice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            AuthNotice::QrReady { url, .. } => println!("\n  {}\n", url),
            AuthNotice::Scanned => println!("Scanned, confirm the login on your phone..."),
            AuthNotice::Confirmed => println!("Confirmed, fetching your space..."),
        }
    }
}

async fn render_upload(bar: ProgressBar, mut events: mpsc::UnboundedReceiver<UploadEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UploadEvent::PartCompleted {
                part_number,
                bytes_done,
                total_bytes,
            } => {
                bar.set_length(total_bytes);
                bar.set_position(bytes_done);
                bar.set_message(format!("part {} done", part_number));
            }
            UploadEvent::Finished(_) => bar.finish_with_message("confirmed"),
            UploadEvent::Failed {
                completed_parts,
                total_parts,
                ..
            } => bar.abandon_with_message(format!(
                "{} of {} parts uploaded",
                completed_parts, total_parts
            )),
        }
    }
}
