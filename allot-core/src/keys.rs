//! Names of the shared keys the engine reads and writes.

pub fn lock(resource_id: &str) -> String {
    format!("quota:lock:{resource_id}")
}

pub fn remaining(resource_id: &str) -> String {
    format!("quota:remaining:{resource_id}")
}

pub fn policy(resource_id: &str) -> String {
    format!("policy:{resource_id}")
}

pub fn record(record_id: &str) -> String {
    format!("record:{record_id}")
}

pub fn ticket(ticket_id: &str) -> String {
    format!("ticket:{ticket_id}")
}

pub fn pending(resource_id: &str, requester_id: &str) -> String {
    format!("intent:pending:{resource_id}:{requester_id}")
}

pub fn enqueued(resource_id: &str) -> String {
    format!("intent:enqueued:{resource_id}")
}

pub fn finalized(resource_id: &str) -> String {
    format!("intent:finalized:{resource_id}")
}
