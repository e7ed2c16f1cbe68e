#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use muster_domain::UserId;
use tracing::info;

/// Outbound notification transport. The production transports live behind
/// this seam so workers can be tested without network side effects.
#[async_trait]
pub trait Notifier: Send + Sync {
	async fn deliver_push(
		&self,
		user_ids: &[UserId],
		title: &str,
		body: &str,
		data: &BTreeMap<String, String>,
	) -> anyhow::Result<()>;

	async fn deliver_email(
		&self,
		to: &str,
		subject: &str,
		template: &str,
		data: &BTreeMap<String, String>,
	) -> anyhow::Result<()>;
}

/// Logs deliveries instead of sending them. Stands in until a real push
/// or email provider is wired up.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
	async fn deliver_push(
		&self,
		user_ids: &[UserId],
		title: &str,
		_body: &str,
		_data: &BTreeMap<String, String>,
	) -> anyhow::Result<()> {
		info!(recipients = user_ids.len(), title, "push notification delivered (log only)");
		Ok(())
	}

	async fn deliver_email(
		&self,
		to: &str,
		subject: &str,
		template: &str,
		_data: &BTreeMap<String, String>,
	) -> anyhow::Result<()> {
		info!(to, subject, template, "email delivered (log only)");
		Ok(())
	}
}
