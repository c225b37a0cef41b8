//! Object command handlers.

use std::path::{Path, PathBuf};

use stowage::storage::local::content_type_for;
use stowage::{StorageFacade, Tier};
use tokio::io::AsyncWriteExt;

use super::{CommandResult, print_json};

/// Upload command.
pub async fn cmd_upload(
    storage: &StorageFacade,
    input: PathBuf,
    owner: String,
    content_type: Option<String>,
) -> CommandResult {
    let filename = file_name(&input)?;
    let content_type =
        content_type.unwrap_or_else(|| content_type_for(&filename).to_string());
    let file = tokio::fs::File::open(&input).await?;

    let stored = storage
        .upload(file, &owner, &filename, &content_type)
        .await?;

    println!("Uploaded {}:", stored.value.display_name);
    println!("  Path: {}", stored.value.path);
    println!("  Size: {} bytes", stored.value.size);
    if let Some(url) = &stored.value.public_url {
        println!("  URL: {url}");
    }
    print_tier(stored.tier);
    Ok(())
}

/// Download command. Writes to `output`, or stdout when omitted.
pub async fn cmd_download(
    storage: &StorageFacade,
    path: String,
    output: Option<PathBuf>,
) -> CommandResult {
    let mut download = storage.download(&path).await?;
    let copied = match output {
        Some(output) => {
            let mut file = tokio::fs::File::create(&output).await?;
            let copied = tokio::io::copy(&mut download.value, &mut file).await?;
            file.flush().await?;
            copied
        },
        None => {
            let mut stdout = tokio::io::stdout();
            let copied = tokio::io::copy(&mut download.value, &mut stdout).await?;
            stdout.flush().await?;
            copied
        },
    };
    tracing::info!(path = %path, bytes = copied, tier = download.tier.as_str(), "Downloaded object");
    Ok(())
}

/// Delete command.
pub async fn cmd_delete(storage: &StorageFacade, path: String) -> CommandResult {
    let deleted = storage.delete_file(&path).await?;
    println!("Deleted: {path}");
    print_tier(deleted.tier);
    Ok(())
}

/// Download URL command.
pub async fn cmd_url(storage: &StorageFacade, path: String, ttl: u64) -> CommandResult {
    let url = storage.get_download_url(&path, ttl).await?;
    match &url.value {
        Some(url) => println!("{url}"),
        None => println!("No URL available for {path}"),
    }
    print_tier(url.tier);
    Ok(())
}

/// Exists command.
pub async fn cmd_exists(storage: &StorageFacade, path: String) -> CommandResult {
    let exists = storage.file_exists(&path).await?;
    println!("{}", exists.value);
    print_tier(exists.tier);
    Ok(())
}

/// Metadata command.
pub async fn cmd_stat(storage: &StorageFacade, path: String) -> CommandResult {
    let metadata = storage.get_metadata(&path).await?;
    match &metadata.value {
        Some(_) => print_json(&metadata),
        None => {
            println!("Not found: {path}");
            Ok(())
        },
    }
}

fn file_name(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| format!("not a file path: {}", path.display()).into())
}

fn print_tier(tier: Tier) {
    if tier == Tier::Fallback {
        println!("  Note: served from the local fallback tier");
    }
}
