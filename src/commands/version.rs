//! Version history handlers.

use stowage::services::NewFile;
use stowage::storage::local::content_type_for;
use stowage::{FileId, StowageConfig, VersioningService};

use super::{CommandResult, VersionAction, print_json};

/// Version command.
pub async fn cmd_version(
    service: &VersioningService,
    config: &StowageConfig,
    action: VersionAction,
) -> CommandResult {
    match action {
        VersionAction::Create {
            file_id,
            input,
            actor,
            note,
            owner,
            content_type,
        } => {
            let file_id = FileId::new(file_id);
            let content = tokio::fs::read(&input).await?;

            if service.head(&file_id)?.is_none() {
                let filename = input
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("content")
                    .to_string();
                let content_type = content_type
                    .unwrap_or_else(|| content_type_for(&filename).to_string());
                let version = service
                    .register_file(
                        NewFile {
                            file_id,
                            owner_id: owner.unwrap_or_else(|| actor.clone()),
                            filename,
                            content_type,
                        },
                        &actor,
                        &content,
                    )
                    .await?;
                println!("Registered {} as v{}", version.file_id, version.version);
                return Ok(());
            }

            match service
                .create_version(&file_id, &actor, &content, note.as_deref())
                .await?
            {
                Some(version) => println!("Created {} v{}", version.file_id, version.version),
                None => println!("Content unchanged; no version created"),
            }
            Ok(())
        },
        VersionAction::Restore {
            file_id,
            version,
            actor,
        } => {
            let outcome = service
                .restore_version(&FileId::new(file_id), version, &actor)
                .await?;
            print_json(&outcome)
        },
        VersionAction::Prune { file_id, keep } => {
            let keep = keep.unwrap_or(config.versioning.keep_versions);
            let report = service
                .prune_old_versions(&FileId::new(file_id), keep)
                .await?;
            print_json(&report)
        },
        VersionAction::List { file_id } => {
            let versions = service.list_versions(&FileId::new(file_id))?;
            print_json(&versions)
        },
        VersionAction::Diff { file_id, from, to } => {
            let diff = service.compare_versions(&FileId::new(file_id), from, to)?;
            print_json(&diff)
        },
    }
}
