// service/effects.rs
use std::sync::Arc;

use serde_json::Value;

use crate::{
    db::cache::CachePort,
    mail::sendmail::{EmailMessage, Notifier},
    models::auditmodel::AuditEvent,
    service::{
        audit_service::AuditService,
        document_service::{DocumentKind, DocumentRenderer},
    },
};

/// Work that must only happen once the primary write has committed.
#[derive(Debug, Clone)]
pub enum Effect {
    Audit(AuditEvent),
    Email(EmailMessage),
    Render { kind: DocumentKind, snapshot: Value },
    InvalidateCache(Vec<String>),
}

/// Outbox collected while a use case runs and handed to the
/// `EffectRunner` after commit.
#[derive(Debug, Default)]
pub struct Effects(Vec<Effect>);

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit(&mut self, event: AuditEvent) -> &mut Self {
        self.0.push(Effect::Audit(event));
        self
    }

    pub fn email(&mut self, message: EmailMessage) -> &mut Self {
        self.0.push(Effect::Email(message));
        self
    }

    pub fn render(&mut self, kind: DocumentKind, snapshot: Value) -> &mut Self {
        self.0.push(Effect::Render { kind, snapshot });
        self
    }

    pub fn invalidate(&mut self, tags: Vec<String>) -> &mut Self {
        self.0.push(Effect::InvalidateCache(tags));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Runs post-commit effects. Every failure is logged and dropped; nothing
/// here can change the result a caller already has.
#[derive(Clone)]
pub struct EffectRunner {
    audit: AuditService,
    notifier: Arc<dyn Notifier>,
    renderer: Arc<dyn DocumentRenderer>,
    cache: Arc<dyn CachePort>,
    /// Spawn onto the runtime instead of awaiting inline.
    detached: bool,
}

impl EffectRunner {
    pub fn new(
        audit: AuditService,
        notifier: Arc<dyn Notifier>,
        renderer: Arc<dyn DocumentRenderer>,
        cache: Arc<dyn CachePort>,
        detached: bool,
    ) -> Self {
        Self {
            audit,
            notifier,
            renderer,
            cache,
            detached,
        }
    }

    pub async fn run(&self, effects: Effects) {
        if effects.is_empty() {
            return;
        }

        // Cache invalidation stays inline so the caller's next read is fresh.
        let mut deferred = Vec::with_capacity(effects.len());
        for effect in effects.0 {
            match effect {
                Effect::InvalidateCache(tags) => self.cache.invalidate_by_tags(&tags).await,
                other => deferred.push(other),
            }
        }

        if self.detached {
            let runner = self.clone();
            tokio::spawn(async move {
                runner.execute(deferred).await;
            });
        } else {
            self.execute(deferred).await;
        }
    }

    async fn execute(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Audit(event) => {
                    if let Err(e) = self.audit.log(&event).await {
                        tracing::warn!("Failed to record audit event {}: {}", event.event_type, e);
                    }
                }
                Effect::Email(message) => {
                    if let Err(e) = self.notifier.send_email(&message).await {
                        tracing::warn!("Failed to send '{}' to {}: {}", message.subject, message.to, e);
                    }
                }
                Effect::Render { kind, snapshot } => {
                    if let Err(e) = self.renderer.render(kind, &snapshot).await {
                        tracing::warn!("Failed to request {} render: {}", kind.as_str(), e);
                    }
                }
                Effect::InvalidateCache(tags) => self.cache.invalidate_by_tags(&tags).await,
            }
        }
    }
}
