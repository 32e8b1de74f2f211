//! Stakeholder email construction
//!
//! Bodies are plain text: what failed, the counts, and for validation
//! failures a bounded sample of DLQ reasons. Duplicate-file emails carry
//! reprocessing instructions.

use super::{EmailMessage, NotifyContext};
use crate::pipeline::LoadCounts;
use crate::sources::SourceConfig;
use fileloader_common::LoadError;

/// Reasons included in a validation-failure email.
pub const MAX_DLQ_REASONS: usize = 50;

pub fn build_failure_email(
    source: &SourceConfig,
    filename: &str,
    err: &LoadError,
    counts: LoadCounts,
    dlq_reasons: &[String],
    context: &NotifyContext,
) -> EmailMessage {
    let subject = format!(
        "[FileLoader] {} failed for {filename} ({})",
        err.kind(),
        source.name
    );

    let mut body = String::new();
    body.push_str(&format!("Source: {}\n", source.name));
    body.push_str(&format!("File: {filename}\n"));
    body.push_str(&format!("Failure: {err}\n\n"));
    body.push_str(&format!(
        "Rows read: {}, valid: {}, invalid: {}, published: {}\n",
        counts.read, counts.valid, counts.invalid, counts.published
    ));

    match err {
        LoadError::DuplicateFile { .. } => {
            body.push_str(&format!(
                "\nThe file has already been processed and was moved to {}.\n\
                 To reprocess it:\n\
                 1. Remove the previously loaded rows from {} where source_filename = '{filename}'\n\
                 2. Move the file from the duplicates directory back into the drop directory\n",
                context.duplicate_files_path, source.target_table
            ));
        },
        LoadError::ValidationThresholdExceeded { .. } | LoadError::GrainValidation { .. } => {
            if !dlq_reasons.is_empty() {
                body.push_str(&format!(
                    "\nFirst {} failure reasons (full set in the dead-letter table):\n",
                    dlq_reasons.len().min(MAX_DLQ_REASONS)
                ));
                for reason in dlq_reasons.iter().take(MAX_DLQ_REASONS) {
                    body.push_str(&format!("  - {reason}\n"));
                }
            }
        },
        _ => {},
    }
    body.push_str(&format!(
        "\nAn archived copy of the file is kept in {}.\n",
        context.archive_path
    ));

    let mut cc = source.notify.cc.clone();
    if let Some(ref data_team) = context.data_team_email {
        if !cc.contains(data_team) {
            cc.push(data_team.clone());
        }
    }

    EmailMessage {
        to: source.notify.recipients.clone(),
        cc,
        subject,
        body,
        attachments: Vec::new(),
    }
}
