//! Mapping of remote labels and messages onto local mailboxes

use crate::remote::{Label, LabelType, MessageMetadata, labels};
use crate::update::{Mailbox, Message};
use chrono::{DateTime, Utc};

/// Id of the placeholder mailbox that parents user folders.
pub const FOLDERS_ID: &str = "folders-root";
/// Id of the placeholder mailbox that parents user labels.
pub const LABELS_ID: &str = "labels-root";

const FOLDERS_NAME: &str = "Folders";
const LABELS_NAME: &str = "Labels";

/// System labels surfaced as mailboxes, with their local names.
const SYSTEM_MAILBOXES: [(&str, &str); 8] = [
    (labels::INBOX, "INBOX"),
    (labels::DRAFTS, "Drafts"),
    (labels::SENT, "Sent"),
    (labels::STARRED, "Starred"),
    (labels::ARCHIVE, "Archive"),
    (labels::SPAM, "Spam"),
    (labels::TRASH, "Trash"),
    (labels::ALL_MAIL, "All Mail"),
];

/// Whether a remote label becomes a local mailbox.
#[must_use]
pub fn is_wanted(label: &Label) -> bool {
    match label.kind {
        LabelType::System => is_wanted_id(&label.id),
        LabelType::Folder | LabelType::Label => true,
    }
}

fn is_wanted_id(label_id: &str) -> bool {
    SYSTEM_MAILBOXES.iter().any(|(id, _)| *id == label_id)
}

/// The local mailbox for a wanted label.
#[must_use]
pub fn to_mailbox(label: &Label) -> Option<Mailbox> {
    let name = match label.kind {
        LabelType::System => {
            let (_, name) = SYSTEM_MAILBOXES.iter().find(|(id, _)| *id == label.id)?;
            vec![(*name).to_string()]
        }
        LabelType::Folder => prefixed(FOLDERS_NAME, &label.path),
        LabelType::Label => prefixed(LABELS_NAME, &label.path),
    };

    Some(Mailbox {
        id: label.id.clone(),
        name,
        selectable: true,
    })
}

fn prefixed(root: &str, path: &str) -> Vec<String> {
    std::iter::once(root.to_string())
        .chain(
            path.split('/')
                .filter(|part| !part.is_empty())
                .map(ToString::to_string),
        )
        .collect()
}

/// Every mailbox of the account, placeholders first, in a stable
/// order: system mailboxes, then folders and labels sorted by path.
#[must_use]
pub fn mailboxes(remote_labels: &[Label]) -> Vec<Mailbox> {
    let mut result = vec![
        Mailbox {
            id: FOLDERS_ID.to_string(),
            name: vec![FOLDERS_NAME.to_string()],
            selectable: false,
        },
        Mailbox {
            id: LABELS_ID.to_string(),
            name: vec![LABELS_NAME.to_string()],
            selectable: false,
        },
    ];

    for (id, _) in SYSTEM_MAILBOXES {
        if let Some(mailbox) = remote_labels
            .iter()
            .find(|l| l.kind == LabelType::System && l.id == id)
            .and_then(to_mailbox)
        {
            result.push(mailbox);
        }
    }

    let mut user: Vec<&Label> = remote_labels
        .iter()
        .filter(|l| l.kind != LabelType::System)
        .collect();
    user.sort_by(|a, b| (a.kind as u8, &a.path).cmp(&(b.kind as u8, &b.path)));
    result.extend(user.into_iter().filter_map(to_mailbox));

    result
}

/// Translate remote metadata into a local message, keeping only the
/// labels that exist as mailboxes.
#[must_use]
pub fn to_message(meta: &MessageMetadata, known: &dyn Fn(&str) -> bool) -> Message {
    Message {
        id: meta.id.clone(),
        address_id: meta.address_id.clone(),
        mailbox_ids: mailbox_ids(meta, known),
        seen: !meta.unread,
        flagged: meta.has_label(labels::STARRED),
        subject: meta.subject.clone(),
        sender: meta.sender.clone(),
        date: DateTime::<Utc>::from_timestamp(meta.time, 0).unwrap_or_default(),
    }
}

#[must_use]
pub fn mailbox_ids(meta: &MessageMetadata, known: &dyn Fn(&str) -> bool) -> Vec<String> {
    meta.label_ids
        .iter()
        .filter(|id| is_wanted_id(id) || known(id))
        .cloned()
        .collect()
}
