use crate::auth::Actor;
use crate::error::{LedgerError, Result};
use crate::jobs::{not_open, Completion, JobEngine};
use crate::ledger::{Ledger, Mutation};
use crate::types::{Job, ProofRequest, ReviewOutcome, Submission, SubmissionStatus, User};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Reviewed {
    pub submission: Submission,
    /// Present when the approval counted and paid the unit
    pub completion: Option<Completion>,
}

/// Proof-of-work review. Approval is the one path that counts a job unit
/// and pays the worker; the submission id doubles as the unit id so a
/// replayed settlement never counts twice.
#[derive(Clone)]
pub struct ReviewWorkflow {
    ledger: Ledger,
    jobs: JobEngine,
}

impl ReviewWorkflow {
    pub fn new(ledger: Ledger, jobs: JobEngine) -> Self {
        Self { ledger, jobs }
    }

    pub async fn submit_proof(&self, worker: &Actor, job_id: &str, proof: ProofRequest) -> Result<Submission> {
        let user = self.ledger.fetch::<User>(worker.user_id()).await?;
        if user.is_banned() {
            return Err(LedgerError::PermissionDenied(format!("account {} is banned", user.user_id)));
        }
        let proof_text = proof.proof_text.trim();
        if proof_text.is_empty() && proof.proof_image.is_none() {
            return Err(LedgerError::InvalidInput("proof text or image is required".into()));
        }
        // A full job is refused at review time
        let job = self.jobs.get_job(job_id).await?;
        if job.poster_id == worker.user_id() {
            return Err(LedgerError::PermissionDenied("posters cannot submit proof for their own job".into()));
        }
        if !job.is_open() {
            return Err(not_open(&job));
        }

        let submission = Submission {
            submission_id: proof
                .request_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            job_id: job_id.to_string(),
            worker_id: worker.user_id().to_string(),
            proof_text: proof_text.to_string(),
            proof_image: proof.proof_image,
            status: SubmissionStatus::Pending,
            settled: false,
            submitted_at: chrono::Utc::now().to_rfc3339(),
            reviewed_by: None,
            reviewed_at: None,
        };

        let (submission, _) = self.ledger.create(&submission).await?;
        if submission.worker_id != worker.user_id() || submission.job_id != job_id {
            return Err(LedgerError::InvalidInput(format!(
                "submission id {} is already in use",
                submission.submission_id
            )));
        }
        tracing::info!(
            submission_id = %submission.submission_id,
            job_id,
            worker_id = %submission.worker_id,
            "Proof submitted"
        );
        Ok(submission)
    }

    pub async fn get_submission(&self, actor: &Actor, submission_id: &str) -> Result<Submission> {
        let submission = self.ledger.fetch::<Submission>(submission_id).await?;
        if submission.worker_id != actor.user_id() {
            self.require_reviewer(actor, &submission.job_id).await?;
        }
        Ok(submission)
    }

    /// Admins see every pending submission; posters see the pending ones for
    /// their own jobs; workers see their own history.
    pub async fn list_submissions(&self, actor: &Actor) -> Result<Vec<Submission>> {
        let all = self.ledger.list::<Submission>().await?;
        if actor.is_admin() {
            return Ok(all
                .into_iter()
                .filter(|s| s.status == SubmissionStatus::Pending)
                .collect());
        }

        let posted: Vec<String> = self
            .ledger
            .list::<Job>()
            .await?
            .into_iter()
            .filter(|job| job.poster_id == actor.user_id())
            .map(|job| job.job_id)
            .collect();

        Ok(all
            .into_iter()
            .filter(|s| {
                s.worker_id == actor.user_id()
                    || (s.status == SubmissionStatus::Pending && posted.contains(&s.job_id))
            })
            .collect())
    }

    async fn require_reviewer(&self, actor: &Actor, job_id: &str) -> Result<()> {
        if actor.is_admin() {
            return Ok(());
        }
        match self.ledger.find::<Job>(job_id).await? {
            Some(job) if job.entity.poster_id == actor.user_id() => Ok(()),
            _ => Err(LedgerError::PermissionDenied(
                "only the job's poster or the administrator may review its submissions".into(),
            )),
        }
    }

    /// Move a pending submission to its terminal state. The status change is
    /// a conditional write, so two reviewers racing on one submission
    /// produce one winner and one `AlreadyReviewed`.
    pub async fn review(&self, reviewer: &Actor, submission_id: &str, outcome: ReviewOutcome) -> Result<Reviewed> {
        let current = self.ledger.fetch::<Submission>(submission_id).await?;
        self.require_reviewer(reviewer, &current.job_id).await?;
        if current.worker_id == reviewer.user_id() {
            return Err(LedgerError::PermissionDenied("reviewers cannot review their own submission".into()));
        }
        if current.status != SubmissionStatus::Pending {
            return Err(already_reviewed(&current));
        }

        if outcome == ReviewOutcome::Approved {
            let job = self.jobs.get_job(&current.job_id).await?;
            if !job.is_open() {
                return Err(not_open(&job));
            }
            if job.is_full() && !job.completed_units.contains(submission_id) {
                return Err(LedgerError::JobFull {
                    job_id: job.job_id,
                    max_count: job.max_count,
                });
            }
        }

        let reviewer_id = reviewer.user_id().to_string();
        let reviewed_at = chrono::Utc::now().to_rfc3339();
        let result = self
            .ledger
            .mutate::<Submission, _, _>(submission_id, |submission| {
                if submission.status != SubmissionStatus::Pending {
                    return Err(already_reviewed(submission));
                }
                submission.status = match outcome {
                    ReviewOutcome::Approved => SubmissionStatus::Approved,
                    ReviewOutcome::Rejected => SubmissionStatus::Rejected,
                };
                submission.reviewed_by = Some(reviewer_id.clone());
                submission.reviewed_at = Some(reviewed_at.clone());
                Ok(Mutation::Apply(()))
            })
            .await?;

        tracing::info!(
            submission_id,
            job_id = %result.entity.job_id,
            worker_id = %result.entity.worker_id,
            reviewer_id = %reviewer.user_id(),
            status = %result.entity.status,
            "Submission reviewed"
        );

        if result.entity.status == SubmissionStatus::Rejected {
            return Ok(Reviewed {
                submission: result.entity,
                completion: None,
            });
        }
        self.settle(result.entity).await
    }

    /// Finish an approval whose settlement was interrupted. Safe to call any
    /// number of times.
    pub async fn settle_submission(&self, actor: &Actor, submission_id: &str) -> Result<Reviewed> {
        actor.require_admin("settle submissions")?;
        let submission = self.ledger.fetch::<Submission>(submission_id).await?;
        if submission.status != SubmissionStatus::Approved {
            return Err(LedgerError::InvalidState(format!(
                "submission {} is {} and has nothing to settle",
                submission_id, submission.status
            )));
        }
        self.settle(submission).await
    }

    /// Re-drive every approved submission that has not been marked settled.
    pub async fn settle_pending(&self, actor: &Actor) -> Result<Vec<(String, Result<Reviewed>)>> {
        actor.require_admin("settle submissions")?;
        let unsettled: Vec<Submission> = self
            .ledger
            .list::<Submission>()
            .await?
            .into_iter()
            .filter(|s| s.status == SubmissionStatus::Approved && !s.settled)
            .collect();

        let mut results = Vec::with_capacity(unsettled.len());
        for submission in unsettled {
            let id = submission.submission_id.clone();
            results.push((id, self.settle(submission).await));
        }
        Ok(results)
    }

    async fn settle(&self, submission: Submission) -> Result<Reviewed> {
        let completion = self
            .jobs
            .complete_job(&submission.job_id, &submission.worker_id, &submission.submission_id)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    submission_id = %submission.submission_id,
                    error = %e,
                    "Approved submission left unsettled"
                );
            })?;

        let marked = self
            .ledger
            .mutate::<Submission, _, _>(&submission.submission_id, |s| {
                if s.settled {
                    return Ok(Mutation::Keep(()));
                }
                s.settled = true;
                Ok(Mutation::Apply(()))
            })
            .await?;

        Ok(Reviewed {
            submission: marked.entity,
            completion: Some(completion),
        })
    }
}

fn already_reviewed(submission: &Submission) -> LedgerError {
    LedgerError::AlreadyReviewed {
        submission_id: submission.submission_id.clone(),
        status: submission.status.to_string(),
    }
}
