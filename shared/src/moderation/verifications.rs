use super::{get_for, list_for, require_active, require_text, transition};
use crate::auth::Actor;
use crate::error::{LedgerError, Result};
use crate::ledger::{Ledger, Mutation};
use crate::types::{
    User, VerificationDecision, VerificationRequest, VerificationRequestStatus, VerificationStatus,
    VerificationSubmission,
};

#[derive(Clone)]
pub struct VerificationQueue {
    ledger: Ledger,
}

impl VerificationQueue {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// File an identity document for review. A user holds at most one
    /// pending request, tracked by `active_verification` on the user record.
    pub async fn submit(&self, actor: &Actor, submission: VerificationSubmission) -> Result<VerificationRequest> {
        let user = require_active(&self.ledger, actor).await?;
        if user.verification_status == VerificationStatus::Verified {
            return Err(LedgerError::InvalidState(format!(
                "user {} is already verified",
                user.user_id
            )));
        }
        let document_type = require_text(&submission.document_type, "document type")?;
        let image_url = require_text(&submission.image_url, "document image")?;

        // A claim whose request was lost or already decided does not block
        let stale_claim = match &user.active_verification {
            Some(active) => match self.ledger.find::<VerificationRequest>(active).await? {
                Some(existing) if existing.entity.status == VerificationRequestStatus::Pending => {
                    return Err(LedgerError::VerificationInProgress {
                        user_id: user.user_id,
                        request_id: active.clone(),
                    });
                }
                Some(existing) => {
                    // Decided but never mirrored onto the user; finish that first
                    tracing::warn!(
                        request_id = %active,
                        user_id = %user.user_id,
                        "Applying a verification decision left over from an interrupted review"
                    );
                    self.apply_to_user(&existing.entity).await?;
                    if existing.entity.status == VerificationRequestStatus::Verified {
                        return Err(LedgerError::InvalidState(format!(
                            "user {} is already verified",
                            user.user_id
                        )));
                    }
                    None
                }
                None => Some(active.clone()),
            },
            None => None,
        };

        let request = VerificationRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: user.user_id.clone(),
            document_type,
            image_url,
            status: VerificationRequestStatus::Pending,
            submitted_at: chrono::Utc::now().to_rfc3339(),
            decided_at: None,
        };
        self.ledger.create(&request).await?;

        let request_id = request.request_id.clone();
        let claimed = self
            .ledger
            .mutate::<User, _, _>(&user.user_id, |u| {
                if u.active_verification != stale_claim {
                    return Err(LedgerError::VerificationInProgress {
                        user_id: u.user_id.clone(),
                        request_id: u.active_verification.clone().unwrap_or_default(),
                    });
                }
                u.active_verification = Some(request_id.clone());
                u.verification_status = VerificationStatus::Pending;
                Ok(Mutation::Apply(()))
            })
            .await;

        if let Err(e) = claimed {
            // Lost the race to another submission; take our request back out
            self.ledger.remove::<VerificationRequest>(&request.request_id).await?;
            return Err(e);
        }

        tracing::info!(
            request_id = %request.request_id,
            user_id = %request.user_id,
            document_type = %request.document_type,
            "Verification submitted"
        );
        Ok(request)
    }

    pub async fn decide(
        &self,
        actor: &Actor,
        request_id: &str,
        decision: VerificationDecision,
    ) -> Result<VerificationRequest> {
        let target = match decision {
            VerificationDecision::Verified => VerificationRequestStatus::Verified,
            VerificationDecision::Rejected => VerificationRequestStatus::Rejected,
        };
        let request = transition::<VerificationRequest>(&self.ledger, actor, request_id, target).await?;
        self.apply_to_user(&request).await?;
        Ok(request)
    }

    pub async fn recover(&self, actor: &Actor, request_id: &str) -> Result<VerificationRequest> {
        actor.require_admin("recover verification requests")?;
        let request = self.ledger.fetch::<VerificationRequest>(request_id).await?;
        if request.status != VerificationRequestStatus::Pending {
            self.apply_to_user(&request).await?;
        }
        Ok(request)
    }

    /// Mirror a decided request onto the user. Only the request the user is
    /// currently waiting on, or an unclaimed one while the user shows
    /// `Pending`, may change the user's status.
    async fn apply_to_user(&self, request: &VerificationRequest) -> Result<()> {
        let status = match request.status {
            VerificationRequestStatus::Verified => VerificationStatus::Verified,
            VerificationRequestStatus::Rejected => VerificationStatus::Rejected,
            VerificationRequestStatus::Pending => return Ok(()),
        };

        let result = self
            .ledger
            .mutate::<User, _, _>(&request.user_id, |user| {
                let owns_claim = user.active_verification.as_deref() == Some(request.request_id.as_str());
                let unclaimed = user.active_verification.is_none() && user.verification_status == VerificationStatus::Pending;
                if !owns_claim && !unclaimed {
                    return Ok(Mutation::Keep(()));
                }
                user.verification_status = status;
                user.active_verification = None;
                Ok(Mutation::Apply(()))
            })
            .await?;

        if result.written {
            tracing::info!(
                request_id = %request.request_id,
                user_id = %request.user_id,
                verification_status = ?status,
                "User verification status updated"
            );
        }
        Ok(())
    }

    pub async fn list(&self, actor: &Actor) -> Result<Vec<VerificationRequest>> {
        list_for::<VerificationRequest>(&self.ledger, actor).await
    }

    pub async fn get(&self, actor: &Actor, request_id: &str) -> Result<VerificationRequest> {
        get_for::<VerificationRequest>(&self.ledger, actor, request_id).await
    }
}
