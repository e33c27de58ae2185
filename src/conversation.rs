//! Per-doctor conversation overview: who the doctor has talked to, the
//! latest line of each thread and how much of it is still unread.

use crate::{
    chat::{ChatMessage, PatientSummary},
    entity::Role,
    error::Result,
    store::Store,
};
use std::collections::HashMap;
use tracing::warn;

/// Aggregate of one counterpart's thread before directory resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub counterpart_id: String,
    pub last_message: String,
    pub unread_count: u32,
    last_position: usize,
}

/// Group `messages` (oldest first) by the participant on the other side of
/// `owner_id`. The last message of a thread is the last one in input
/// order, so creation-time ties resolve to the later insert. Threads come
/// back most recently active first.
pub fn summarize(owner_id: &str, messages: &[ChatMessage]) -> Vec<Thread> {
    let mut threads: HashMap<&str, Thread> = HashMap::new();

    for (position, msg) in messages.iter().enumerate() {
        let Some(counterpart) = msg.counterpart_of(owner_id) else {
            continue;
        };

        let thread = threads.entry(counterpart).or_insert_with(|| Thread {
            counterpart_id: counterpart.to_string(),
            last_message: String::new(),
            unread_count: 0,
            last_position: position,
        });

        thread.last_message.clone_from(&msg.message);
        thread.last_position = position;

        if msg.receiver_id == owner_id && !msg.is_read {
            thread.unread_count += 1;
        }
    }

    let mut threads: Vec<Thread> = threads.into_values().collect();
    threads.sort_by(|a, b| b.last_position.cmp(&a.last_position));
    threads
}

/// Patient sidebar for `doctor_id`, recomputed from the log on every call.
///
/// Counterparts that no longer resolve to a user in the directory are
/// logged and left out.
pub async fn patients_for_doctor(store: &Store, doctor_id: &str) -> Result<Vec<PatientSummary>> {
    let messages = store.messages_involving(doctor_id).await?;
    let threads = summarize(doctor_id, &messages);

    let mut summaries = Vec::with_capacity(threads.len());
    for thread in threads {
        match store.profile(&thread.counterpart_id).await? {
            Some(profile) if profile.role == Role::User => summaries.push(PatientSummary {
                id: profile.id,
                name: profile.name,
                profile_pic: profile.image,
                last_message: thread.last_message,
                unread_count: thread.unread_count,
            }),
            Some(profile) => warn!(
                doctor = doctor_id,
                counterpart = %profile.participant(),
                "Skipping conversation whose counterpart is not a patient"
            ),
            None => warn!(
                doctor = doctor_id,
                counterpart = %thread.counterpart_id,
                "Skipping conversation with counterpart missing from directory"
            ),
        }
    }

    Ok(summaries)
}
