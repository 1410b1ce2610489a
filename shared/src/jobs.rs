use crate::auth::Actor;
use crate::balance::{Applied, BalanceEngine, BalanceField};
use crate::error::{LedgerError, Result};
use crate::ledger::{Created, Ledger, Mutation};
use crate::money::Money;
use crate::types::{Job, NewJob, User, INTERNATIONAL};
use serde::Serialize;

/// Outcome of counting one unit of work against a job.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub job_id: String,
    pub worker_id: String,
    pub unit_id: String,
    pub payout: Money,
    /// False when this unit had already been counted by an earlier call
    pub newly_completed: bool,
    pub completed_count: u32,
    pub max_count: u32,
}

pub fn completion_award_key(job_id: &str, unit_id: &str) -> String {
    format!("job:{}:{}", job_id, unit_id)
}

pub fn escrow_key(job_id: &str) -> String {
    format!("job-escrow:{}", job_id)
}

pub fn refund_key(job_id: &str) -> String {
    format!("job-refund:{}", job_id)
}

fn escrow_for(payout: Money, count: u32) -> Result<Money> {
    payout
        .checked_mul(count)
        .ok_or_else(|| LedgerError::InvalidInput("payout × max_count is too large".into()))
}

#[derive(Clone)]
pub struct JobEngine {
    ledger: Ledger,
    balances: BalanceEngine,
}

impl JobEngine {
    pub fn new(ledger: Ledger, balances: BalanceEngine) -> Self {
        Self { ledger, balances }
    }

    /// Create the job and take `payout × max_count` from the poster's
    /// deposit. The job stays hidden until the escrow lands; a replay with
    /// the same `request_id` resumes the funding instead of charging again.
    pub async fn post_job(&self, poster: &Actor, new_job: NewJob) -> Result<Job> {
        let title = new_job.title.trim();
        if title.is_empty() {
            return Err(LedgerError::InvalidInput("job title is required".into()));
        }
        if new_job.max_count == 0 {
            return Err(LedgerError::InvalidInput("max_count must be at least 1".into()));
        }
        let minimum = new_job.category.min_payout();
        if new_job.payout < minimum {
            return Err(LedgerError::InvalidInput(format!(
                "payout ${} is below the ${} minimum for {:?} jobs",
                new_job.payout, minimum, new_job.category
            )));
        }
        escrow_for(new_job.payout, new_job.max_count)?;
        let poster_user = self.ledger.fetch::<User>(poster.user_id()).await?;
        if poster_user.is_banned() {
            return Err(LedgerError::PermissionDenied(format!(
                "account {} is banned",
                poster.user_id()
            )));
        }

        let target_country = match new_job.target_country.trim() {
            "" => INTERNATIONAL.to_string(),
            country => country.to_string(),
        };

        let job = Job {
            job_id: new_job
                .request_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            poster_id: poster.user_id().to_string(),
            title: title.to_string(),
            category: new_job.category,
            payout: new_job.payout,
            completed_count: 0,
            max_count: new_job.max_count,
            target_country,
            is_top_job: new_job.is_top_job,
            instructions: new_job.instructions,
            thumbnail: new_job.thumbnail,
            completed_units: Default::default(),
            funded: false,
            closed: false,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let (job, created) = self.ledger.create(&job).await?;
        if created == Created::AlreadyExisted && job.poster_id != poster.user_id() {
            return Err(LedgerError::InvalidInput(format!("job id {} is already in use", job.job_id)));
        }
        if job.funded {
            return Ok(job);
        }
        let job = self.fund(job).await?;
        tracing::info!(
            job_id = %job.job_id,
            poster_id = %job.poster_id,
            payout = %job.payout,
            max_count = job.max_count,
            "Job posted"
        );
        Ok(job)
    }

    /// Finish funding a job whose post was interrupted after it was created.
    pub async fn recover_job(&self, actor: &Actor, job_id: &str) -> Result<Job> {
        actor.require_admin("recover jobs")?;
        let job = self.get_job(job_id).await?;
        if job.funded || job.closed {
            return Ok(job);
        }
        tracing::warn!(job_id, poster_id = %job.poster_id, "Resuming an interrupted job funding");
        self.fund(job).await
    }

    async fn fund(&self, job: Job) -> Result<Job> {
        let escrow = escrow_for(job.payout, job.max_count)?;
        let debited = self
            .balances
            .debit_once(&job.poster_id, BalanceField::Deposit, escrow, &escrow_key(&job.job_id))
            .await;
        if let Err(e) = debited {
            if matches!(e, LedgerError::InsufficientFunds { .. }) {
                tracing::info!(job_id = %job.job_id, poster_id = %job.poster_id, escrow = %escrow, "Job refused, deposit too low");
                self.ledger.remove::<Job>(&job.job_id).await?;
            }
            return Err(e);
        }

        let funded = self
            .ledger
            .mutate::<Job, _, _>(&job.job_id, |job| {
                if job.funded {
                    return Ok(Mutation::Keep(()));
                }
                job.funded = true;
                Ok(Mutation::Apply(()))
            })
            .await?;
        Ok(funded.entity)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.ledger.fetch::<Job>(job_id).await
    }

    /// Open jobs visible to a worker in `country`; every open job when no
    /// country is given.
    pub async fn list_jobs(&self, country: Option<&str>) -> Result<Vec<Job>> {
        let mut jobs = self.ledger.list::<Job>().await?;
        jobs.retain(|job| job.is_open());
        if let Some(country) = country {
            jobs.retain(|job| job.is_visible_in(country));
        }
        jobs.sort_by(|a, b| b.is_top_job.cmp(&a.is_top_job).then(b.created_at.cmp(&a.created_at)));
        Ok(jobs)
    }

    /// Close the job, return the unused escrow to the poster's deposit and
    /// remove it. Returns the amount refunded.
    pub async fn delete_job(&self, actor: &Actor, job_id: &str) -> Result<Money> {
        actor.require_admin("delete jobs")?;
        let job = self
            .ledger
            .mutate::<Job, _, _>(job_id, |job| {
                if job.closed {
                    return Ok(Mutation::Keep(()));
                }
                job.closed = true;
                Ok(Mutation::Apply(()))
            })
            .await?
            .entity;

        let mut refunded = Money::ZERO;
        if self.balances.is_applied(&job.poster_id, &escrow_key(job_id)).await? {
            refunded = escrow_for(job.payout, job.remaining())?;
            if !refunded.is_zero() {
                self.balances
                    .credit_once(&job.poster_id, BalanceField::Deposit, refunded, &refund_key(job_id))
                    .await?;
            }
        }

        self.ledger.remove::<Job>(job_id).await?;
        tracing::info!(job_id, poster_id = %job.poster_id, refunded = %refunded, "Job deleted");
        Ok(refunded)
    }

    /// Count `unit_id` against the job and pay the worker.
    ///
    /// The counter only moves through a conditional write, so concurrent
    /// completions near the cap cannot overshoot it: the losers re-read and
    /// see the job full. Both steps are keyed by the unit, so re-running
    /// after a crash between them finishes the credit without counting
    /// twice.
    pub async fn complete_job(&self, job_id: &str, worker_id: &str, unit_id: &str) -> Result<Completion> {
        if unit_id.is_empty() {
            return Err(LedgerError::InvalidInput("unit id is required".into()));
        }
        let worker = self.ledger.fetch::<User>(worker_id).await?;
        if worker.is_banned() {
            return Err(LedgerError::PermissionDenied(format!("account {} is banned", worker_id)));
        }

        let counted = self
            .ledger
            .mutate::<Job, _, _>(job_id, |job| {
                if job.completed_units.contains(unit_id) {
                    return Ok(Mutation::Keep(()));
                }
                if !job.is_open() {
                    return Err(not_open(job));
                }
                if job.is_full() {
                    return Err(LedgerError::JobFull {
                        job_id: job.job_id.clone(),
                        max_count: job.max_count,
                    });
                }
                job.completed_count += 1;
                job.completed_units.insert(unit_id.to_string());
                Ok(Mutation::Apply(()))
            })
            .await
            .inspect_err(|e| {
                if let LedgerError::JobFull { .. } = e {
                    tracing::info!(job_id, worker_id, unit_id, "Completion refused, job is full");
                }
            })?;
        let job = counted.entity;

        let (_, applied) = self
            .balances
            .credit_once(
                worker_id,
                BalanceField::Earnings,
                job.payout,
                &completion_award_key(job_id, unit_id),
            )
            .await?;

        if counted.written {
            tracing::info!(
                job_id,
                worker_id,
                unit_id,
                payout = %job.payout,
                completed_count = job.completed_count,
                max_count = job.max_count,
                "Job unit completed"
            );
        } else if applied == Applied::Applied {
            tracing::warn!(job_id, worker_id, unit_id, "Finished a credit left over from an interrupted completion");
        }

        Ok(Completion {
            job_id: job.job_id,
            worker_id: worker_id.to_string(),
            unit_id: unit_id.to_string(),
            payout: job.payout,
            newly_completed: counted.written,
            completed_count: job.completed_count,
            max_count: job.max_count,
        })
    }
}

pub(crate) fn not_open(job: &Job) -> LedgerError {
    if job.closed {
        LedgerError::InvalidState(format!("job {} is closed", job.job_id))
    } else {
        LedgerError::InvalidState(format!("job {} is not funded yet", job.job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::config::LedgerConfig;
    use crate::store::MemoryStore;
    use crate::types::JobCategory;
    use crate::users::UserDirectory;
    use std::sync::Arc;

    struct Fixture {
        users: UserDirectory,
        jobs: JobEngine,
        balances: BalanceEngine,
        ledger: Ledger,
    }

    fn fixture() -> Fixture {
        let config = LedgerConfig::default().with_admin_email("admin@example.com");
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), config);
        let balances = BalanceEngine::new(ledger.clone());
        Fixture {
            users: UserDirectory::new(ledger.clone()),
            jobs: JobEngine::new(ledger.clone(), balances.clone()),
            balances,
            ledger,
        }
    }

    async fn sign_in(f: &Fixture, id: &str, email: &str) -> Actor {
        let identity = Identity {
            user_id: id.into(),
            email: email.into(),
            name: None,
        };
        f.users.ensure_user(identity).await.unwrap().0
    }

    async fn poster(f: &Fixture, id: &str, deposit: &str) -> Actor {
        let actor = sign_in(f, id, &format!("{}@example.com", id)).await;
        f.balances
            .credit(id, BalanceField::Deposit, deposit.parse().unwrap())
            .await
            .unwrap();
        actor
    }

    async fn deposit_of(f: &Fixture, id: &str) -> Money {
        f.ledger.fetch::<User>(id).await.unwrap().deposit
    }

    fn new_job(category: JobCategory, payout: &str, max_count: u32) -> NewJob {
        NewJob {
            title: "Subscribe to channel".into(),
            category,
            payout: payout.parse().unwrap(),
            max_count,
            target_country: INTERNATIONAL.into(),
            is_top_job: false,
            instructions: None,
            thumbnail: None,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn test_post_job_enforces_category_minimum() {
        let f = fixture();
        let poster = poster(&f, "p1", "10.000").await;

        let err = f
            .jobs
            .post_job(&poster, new_job(JobCategory::Application, "0.050", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));

        let job = f
            .jobs
            .post_job(&poster, new_job(JobCategory::Application, "0.080", 10))
            .await
            .unwrap();
        assert_eq!(job.completed_count, 0);
        assert_eq!(job.poster_id, "p1");
        assert!(job.funded);

        let err = f
            .jobs
            .post_job(&poster, new_job(JobCategory::YouTube, "0.020", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_post_job_takes_escrow_from_deposit() {
        let f = fixture();
        let poster = poster(&f, "p1", "0.100").await;

        let err = f
            .jobs
            .post_job(&poster, new_job(JobCategory::YouTube, "0.020", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert!(f.ledger.list::<Job>().await.unwrap().is_empty());
        assert_eq!(deposit_of(&f, "p1").await, Money::from_millis(100));

        let mut request = new_job(JobCategory::YouTube, "0.020", 4);
        request.request_id = Some("job-1".into());
        let job = f.jobs.post_job(&poster, request.clone()).await.unwrap();
        assert_eq!(job.job_id, "job-1");
        assert_eq!(deposit_of(&f, "p1").await, Money::from_millis(20));

        let replayed = f.jobs.post_job(&poster, request).await.unwrap();
        assert_eq!(replayed.job_id, "job-1");
        assert_eq!(deposit_of(&f, "p1").await, Money::from_millis(20));
        assert_eq!(f.jobs.list_jobs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unfunded_job_is_hidden_until_recovered() {
        let f = fixture();
        let poster = poster(&f, "p1", "1.000").await;
        let admin = sign_in(&f, "a1", "admin@example.com").await;
        sign_in(&f, "w1", "w1@example.com").await;
        let job = Job {
            job_id: "half-posted".into(),
            poster_id: poster.user_id().into(),
            title: "Join group".into(),
            category: JobCategory::Telegram,
            payout: Money::from_millis(10),
            completed_count: 0,
            max_count: 5,
            target_country: INTERNATIONAL.into(),
            is_top_job: false,
            instructions: None,
            thumbnail: None,
            completed_units: Default::default(),
            funded: false,
            closed: false,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        f.ledger.create(&job).await.unwrap();

        assert!(f.jobs.list_jobs(None).await.unwrap().is_empty());
        let err = f.jobs.complete_job("half-posted", "w1", "unit-1").await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
        assert!(matches!(
            f.jobs.recover_job(&poster, "half-posted").await,
            Err(LedgerError::PermissionDenied(_))
        ));

        let recovered = f.jobs.recover_job(&admin, "half-posted").await.unwrap();
        assert!(recovered.funded);
        assert_eq!(deposit_of(&f, "p1").await, Money::from_millis(950));
        f.jobs.recover_job(&admin, "half-posted").await.unwrap();
        assert_eq!(deposit_of(&f, "p1").await, Money::from_millis(950));
        f.jobs.complete_job("half-posted", "w1", "unit-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_pays_and_caps() {
        let f = fixture();
        let poster = poster(&f, "p1", "0.020").await;
        sign_in(&f, "w1", "w1@example.com").await;
        let job = f
            .jobs
            .post_job(&poster, new_job(JobCategory::YouTube, "0.020", 1))
            .await
            .unwrap();

        let done = f.jobs.complete_job(&job.job_id, "w1", "unit-1").await.unwrap();
        assert!(done.newly_completed);
        assert_eq!(done.payout, Money::from_millis(20));
        assert_eq!(done.completed_count, 1);

        let err = f.jobs.complete_job(&job.job_id, "w1", "unit-2").await.unwrap_err();
        assert!(matches!(err, LedgerError::JobFull { max_count: 1, .. }));

        let worker = f.ledger.fetch::<User>("w1").await.unwrap();
        assert_eq!(worker.earnings, Money::from_millis(20));
    }

    #[tokio::test]
    async fn test_repeated_unit_counts_once() {
        let f = fixture();
        let poster = poster(&f, "p1", "1.000").await;
        sign_in(&f, "w1", "w1@example.com").await;
        let job = f
            .jobs
            .post_job(&poster, new_job(JobCategory::YouTube, "0.020", 5))
            .await
            .unwrap();

        f.jobs.complete_job(&job.job_id, "w1", "unit-1").await.unwrap();
        let again = f.jobs.complete_job(&job.job_id, "w1", "unit-1").await.unwrap();
        assert!(!again.newly_completed);
        assert_eq!(again.completed_count, 1);

        let worker = f.ledger.fetch::<User>("w1").await.unwrap();
        assert_eq!(worker.earnings, Money::from_millis(20));
    }

    #[tokio::test]
    async fn test_list_jobs_by_country() {
        let f = fixture();
        let poster = poster(&f, "p1", "1.000").await;
        let mut local = new_job(JobCategory::Facebook, "0.010", 3);
        local.target_country = "Bangladesh".into();
        f.jobs.post_job(&poster, local).await.unwrap();
        f.jobs
            .post_job(&poster, new_job(JobCategory::Facebook, "0.010", 3))
            .await
            .unwrap();

        assert_eq!(f.jobs.list_jobs(None).await.unwrap().len(), 2);
        assert_eq!(f.jobs.list_jobs(Some("Bangladesh")).await.unwrap().len(), 2);
        assert_eq!(f.jobs.list_jobs(Some("India")).await.unwrap().len(), 1);
        assert_eq!(f.jobs.list_jobs(Some(INTERNATIONAL)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_requires_admin_and_refunds_unused_escrow() {
        let f = fixture();
        let poster = poster(&f, "p1", "0.050").await;
        let admin = sign_in(&f, "a1", "admin@example.com").await;
        sign_in(&f, "w1", "w1@example.com").await;
        let job = f
            .jobs
            .post_job(&poster, new_job(JobCategory::Telegram, "0.010", 5))
            .await
            .unwrap();
        assert!(deposit_of(&f, "p1").await.is_zero());
        f.jobs.complete_job(&job.job_id, "w1", "unit-1").await.unwrap();
        f.jobs.complete_job(&job.job_id, "w1", "unit-2").await.unwrap();

        assert!(matches!(
            f.jobs.delete_job(&poster, &job.job_id).await,
            Err(LedgerError::PermissionDenied(_))
        ));
        let refunded = f.jobs.delete_job(&admin, &job.job_id).await.unwrap();
        assert_eq!(refunded, Money::from_millis(30));
        assert_eq!(deposit_of(&f, "p1").await, Money::from_millis(30));
        assert!(matches!(
            f.jobs.get_job(&job.job_id).await,
            Err(LedgerError::NotFound { .. })
        ));
        assert!(f.balances.is_applied("p1", &refund_key(&job.job_id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_job_refuses_completions() {
        let f = fixture();
        let poster = poster(&f, "p1", "0.050").await;
        sign_in(&f, "w1", "w1@example.com").await;
        let job = f
            .jobs
            .post_job(&poster, new_job(JobCategory::Telegram, "0.010", 5))
            .await
            .unwrap();
        f.ledger
            .mutate::<Job, _, _>(&job.job_id, |job| {
                job.closed = true;
                Ok(Mutation::Apply(()))
            })
            .await
            .unwrap();

        let err = f.jobs.complete_job(&job.job_id, "w1", "unit-1").await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
        assert!(f.ledger.fetch::<User>("w1").await.unwrap().earnings.is_zero());
    }
}
