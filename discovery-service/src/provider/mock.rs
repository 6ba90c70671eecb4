//! In-process mock provider.
//!
//! Tests drive it explicitly through `add_user` / `push_email`; dev runs
//! (`DISCOVERY_PROVIDER=mock`) enable synthesis so every poll may grow a
//! user's mailbox by a few generated emails, approximating live traffic.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::error::DiscoveryError;
use crate::models::{ProviderEmail, ProviderUser};

use super::Provider;

const FIRST_NAMES: &[&str] = &[
    "John", "Jane", "Bob", "Alice", "Charlie", "Diana", "Eve", "Frank",
];
const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis",
];
const DOMAINS: &[&str] = &[
    "example.com",
    "company.com",
    "business.org",
    "enterprise.net",
];
const SUBJECTS: &[&str] = &[
    "Meeting tomorrow",
    "Project update",
    "Budget review",
    "Team lunch",
    "Quarterly report",
    "Client feedback",
    "Urgent: Action required",
    "Follow up",
];

pub struct MockProvider {
    tenant_id: Uuid,
    users: RwLock<Vec<ProviderUser>>,
    emails: RwLock<HashMap<Uuid, Vec<ProviderEmail>>>,
    synthesize: bool,
}

impl MockProvider {
    /// Empty provider; tests populate it explicitly.
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            users: RwLock::new(Vec::new()),
            emails: RwLock::new(HashMap::new()),
            synthesize: false,
        }
    }

    /// Provider pre-populated with `count` generated users.
    pub fn seeded(tenant_id: Uuid, count: usize) -> Self {
        let provider = Self::new(tenant_id);
        {
            let mut users = provider.users.write().expect("mock user lock");
            for index in 0..count {
                users.push(generate_user(tenant_id, index));
            }
        }
        provider
    }

    /// Grow each user's mailbox by 0-3 generated emails per poll.
    pub fn with_synthesis(mut self) -> Self {
        self.synthesize = true;
        self
    }

    pub fn add_user(&self, user: ProviderUser) {
        self.users.write().expect("mock user lock").push(user);
    }

    /// Drop a user from the provider's listing. Their emails stay, matching a
    /// provider that stops returning a deactivated account.
    pub fn remove_user(&self, user_id: Uuid) {
        self.users
            .write()
            .expect("mock user lock")
            .retain(|u| u.id != user_id);
    }

    pub fn push_email(&self, email: ProviderEmail) {
        self.emails
            .write()
            .expect("mock email lock")
            .entry(email.user_id)
            .or_default()
            .push(email);
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    fn synthesize_batch(&self, user_id: Uuid) {
        let (user_email, user_name) = {
            let users = self.users.read().expect("mock user lock");
            match users.iter().find(|u| u.id == user_id) {
                Some(user) => (user.email.clone(), user.name.clone()),
                None => return,
            }
        };

        let mut rng = rand::thread_rng();
        let count = rng.gen_range(0..=3);
        let now = Utc::now();

        let mut emails = self.emails.write().expect("mock email lock");
        let mailbox = emails.entry(user_id).or_default();
        for batch_index in 0..count {
            let received_at = now - ChronoDuration::seconds(rng.gen_range(0..30));
            let email = generate_email(
                user_id,
                &user_email,
                &user_name,
                received_at,
                mailbox.len(),
                batch_index,
            );
            mailbox.push(email);
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn get_users(&self, _tenant_id: Uuid) -> Result<Vec<ProviderUser>, DiscoveryError> {
        Ok(self.users.read().expect("mock user lock").clone())
    }

    async fn get_emails(
        &self,
        user_id: Uuid,
        received_after: DateTime<Utc>,
        order_by: &str,
    ) -> Result<Vec<ProviderEmail>, DiscoveryError> {
        if self.synthesize {
            self.synthesize_batch(user_id);
        }

        let emails = self.emails.read().expect("mock email lock");
        let mut matching: Vec<ProviderEmail> = emails
            .get(&user_id)
            .map(|mailbox| {
                mailbox
                    .iter()
                    .filter(|email| email.received_at >= received_after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        match order_by {
            "received_at desc" => matching.sort_by(|a, b| b.received_at.cmp(&a.received_at)),
            _ => matching.sort_by(|a, b| a.received_at.cmp(&b.received_at)),
        }

        Ok(matching)
    }
}

fn generate_user(tenant_id: Uuid, index: usize) -> ProviderUser {
    let first = FIRST_NAMES[index % FIRST_NAMES.len()];
    let last = LAST_NAMES[index % LAST_NAMES.len()];
    let domain = DOMAINS[index % DOMAINS.len()];

    ProviderUser {
        id: Uuid::new_v4(),
        email: format!("{}.{}.{}@{}", first, last, index, domain).to_lowercase(),
        name: format!("{} {}", first, last),
        tenant_id,
        active: true,
        created_at: Utc::now(),
    }
}

fn generate_email(
    user_id: Uuid,
    user_email: &str,
    user_name: &str,
    received_at: DateTime<Utc>,
    mailbox_index: usize,
    batch_index: usize,
) -> ProviderEmail {
    let mut rng = rand::thread_rng();
    let subject = SUBJECTS[rng.gen_range(0..SUBJECTS.len())];
    let from_domain = DOMAINS[rng.gen_range(0..DOMAINS.len())];
    let message_id = Uuid::new_v4();

    // Body carries enough per-recipient detail to make fingerprints unique.
    let body = format!(
        "Dear {} ({}),\n\n{}\n\nreceived_at: {}\nmessage_id: {}\nmailbox index: {}\nbatch index: {}\ntoken: {}\n",
        user_name,
        user_email,
        subject,
        received_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        message_id,
        mailbox_index,
        batch_index,
        rng.gen_range(0..5_000_000u32),
    );

    ProviderEmail {
        message_id: message_id.to_string(),
        user_id,
        from: format!("sender{}@{}", rng.gen_range(0..50_000u32), from_domain),
        to: user_email.to_string(),
        subject: format!("{} [{}]", subject, mailbox_index),
        snippet: format!("This is a snippet for: {}", subject),
        received_at,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email_at(user_id: Uuid, received_at: DateTime<Utc>, body: &str) -> ProviderEmail {
        ProviderEmail {
            message_id: Uuid::new_v4().to_string(),
            user_id,
            from: "sender@example.com".into(),
            to: "user@example.com".into(),
            subject: "subject".into(),
            snippet: "snippet".into(),
            received_at,
            body: body.into(),
        }
    }

    #[tokio::test]
    async fn test_received_after_filter_is_inclusive() {
        let provider = MockProvider::new(Uuid::new_v4());
        let user_id = Uuid::new_v4();
        let cutoff = Utc::now();

        provider.push_email(email_at(user_id, cutoff - ChronoDuration::seconds(5), "old"));
        provider.push_email(email_at(user_id, cutoff, "boundary"));
        provider.push_email(email_at(user_id, cutoff + ChronoDuration::seconds(5), "new"));

        let emails = provider
            .get_emails(user_id, cutoff, "received_at")
            .await
            .unwrap();
        let bodies: Vec<&str> = emails.iter().map(|e| e.body.as_str()).collect();
        assert_eq!(bodies, vec!["boundary", "new"]);
    }

    #[tokio::test]
    async fn test_emails_sorted_ascending_by_default() {
        let provider = MockProvider::new(Uuid::new_v4());
        let user_id = Uuid::new_v4();
        let base = Utc::now();

        provider.push_email(email_at(user_id, base + ChronoDuration::seconds(2), "c"));
        provider.push_email(email_at(user_id, base, "a"));
        provider.push_email(email_at(user_id, base + ChronoDuration::seconds(1), "b"));

        let emails = provider
            .get_emails(user_id, base - ChronoDuration::seconds(1), "received_at")
            .await
            .unwrap();
        let bodies: Vec<&str> = emails.iter().map(|e| e.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_unknown_user_yields_empty_list() {
        let provider = MockProvider::new(Uuid::new_v4());
        let emails = provider
            .get_emails(Uuid::new_v4(), Utc::now(), "received_at")
            .await
            .unwrap();
        assert!(emails.is_empty());
    }

    #[test]
    fn test_seeded_generates_distinct_addresses() {
        let provider = MockProvider::seeded(Uuid::new_v4(), 32);
        let users = provider.users.read().unwrap();
        let mut addresses: Vec<&str> = users.iter().map(|u| u.email.as_str()).collect();
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), 32);
    }
}
