mod common;

use common::{admin, earnings, post_job, services, worker, worker_with_earnings};
use taskhub_shared::balance::BalanceField;
use taskhub_shared::types::{
    ProofRequest, ReviewOutcome, SubmissionStatus, VerificationStatus, VerificationSubmission, WithdrawalRequest,
};
use taskhub_shared::LedgerError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_completions_fill_exactly_max_count() {
    let services = services();
    let poster = worker(&services, "poster").await;
    let job = post_job(&services, &poster, "0.100", 5).await;

    let mut workers = Vec::new();
    for i in 0..20 {
        workers.push(worker(&services, &format!("w{}", i)).await.user_id().to_string());
    }

    let mut handles = Vec::new();
    for worker_id in workers {
        let services = services.clone();
        let job_id = job.job_id.clone();
        handles.push(tokio::spawn(async move {
            let unit = format!("unit-{}", worker_id);
            services.jobs.complete_job(&job_id, &worker_id, &unit).await
        }));
    }

    let mut completed = 0;
    let mut full = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(completion) => {
                assert!(completion.newly_completed);
                completed += 1;
            }
            Err(LedgerError::JobFull { .. }) => full += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(completed, 5);
    assert_eq!(full, 15);

    let job = services.jobs.get_job(&job.job_id).await.unwrap();
    assert_eq!(job.completed_count, 5);
    assert_eq!(job.completed_units.len(), 5);

    let mut paid = 0;
    for i in 0..20 {
        if !earnings(&services, &format!("w{}", i)).await.is_zero() {
            paid += 1;
        }
    }
    assert_eq!(paid, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_slot_goes_to_one_worker() {
    let services = services();
    let poster = worker(&services, "poster").await;
    let job = post_job(&services, &poster, "0.050", 1).await;
    worker(&services, "alice").await;
    worker(&services, "bob").await;

    let a = {
        let services = services.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move { services.jobs.complete_job(&job_id, "alice", "s-alice").await })
    };
    let b = {
        let services = services.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move { services.jobs.complete_job(&job_id, "bob", "s-bob").await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(LedgerError::JobFull { .. }))));

    let total = earnings(&services, "alice").await.millis() + earnings(&services, "bob").await.millis();
    assert_eq!(total, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_debits_never_overdraw() {
    let services = services();
    worker_with_earnings(&services, "u1", "5.000").await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let services = services.clone();
        handles.push(tokio::spawn(async move {
            services
                .balances
                .debit("u1", BalanceField::Earnings, "1.000".parse().unwrap())
                .await
        }));
    }

    let mut ok = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(LedgerError::InsufficientFunds { .. }) => refused += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(refused, 15);
    assert!(earnings(&services, "u1").await.is_zero());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_credits_all_land() {
    let services = services();
    worker(&services, "u1").await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let services = services.clone();
        handles.push(tokio::spawn(async move {
            services
                .balances
                .credit_once("u1", BalanceField::Earnings, "0.250".parse().unwrap(), &format!("award-{}", i % 5))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Ten calls over five distinct keys.
    assert_eq!(earnings(&services, "u1").await.millis(), 1250);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_reviews_have_one_winner() {
    let services = services();
    let admin = admin();
    let poster = worker(&services, "poster").await;
    let job = post_job(&services, &poster, "0.100", 3).await;
    let w1 = worker(&services, "w1").await;
    let submission = services
        .reviews
        .submit_proof(
            &w1,
            &job.job_id,
            ProofRequest {
                proof_text: "followed as @w1".into(),
                proof_image: None,
                request_id: None,
            },
        )
        .await
        .unwrap();

    let approve = {
        let services = services.clone();
        let id = submission.submission_id.clone();
        tokio::spawn(async move { services.reviews.review(&poster, &id, ReviewOutcome::Approved).await })
    };
    let reject = {
        let services = services.clone();
        let id = submission.submission_id.clone();
        tokio::spawn(async move { services.reviews.review(&admin, &id, ReviewOutcome::Rejected).await })
    };

    let results = [approve.await.unwrap(), reject.await.unwrap()];
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(LedgerError::AlreadyReviewed { .. }))));

    let stored = services
        .reviews
        .get_submission(&common::admin(), &submission.submission_id)
        .await
        .unwrap();
    assert_eq!(stored.status, winners[0].submission.status);
    let job = services.jobs.get_job(&job.job_id).await.unwrap();
    match stored.status {
        SubmissionStatus::Approved => {
            assert_eq!(earnings(&services, "w1").await.millis(), 100);
            assert_eq!(job.completed_count, 1);
        }
        _ => {
            assert!(earnings(&services, "w1").await.is_zero());
            assert_eq!(job.completed_count, 0);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_verification_submits_leave_one_request() {
    let services = services();
    let user = worker(&services, "u1").await;

    let mut handles = Vec::new();
    for document in ["National ID", "Passport"] {
        let services = services.clone();
        let user = user.clone();
        handles.push(tokio::spawn(async move {
            services
                .verifications
                .submit(
                    &user,
                    VerificationSubmission {
                        document_type: document.into(),
                        image_url: "https://cdn.example.com/doc.jpg".into(),
                    },
                )
                .await
        }));
    }

    let mut accepted = Vec::new();
    let mut in_progress = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(request) => accepted.push(request),
            Err(LedgerError::VerificationInProgress { .. }) => in_progress += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(accepted.len(), 1);
    assert_eq!(in_progress, 1);

    let requests = services.verifications.list(&admin()).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].request_id, accepted[0].request_id);

    let stored = services.users.get_user("u1").await.unwrap();
    assert_eq!(stored.verification_status, VerificationStatus::Pending);
    assert_eq!(stored.active_verification, Some(accepted[0].request_id.clone()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_withdrawals_leave_no_unreserved_request() {
    let services = services();
    let user = worker_with_earnings(&services, "u1", "5.000").await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let services = services.clone();
        let user = user.clone();
        handles.push(tokio::spawn(async move {
            services
                .withdrawals
                .request(
                    &user,
                    WithdrawalRequest {
                        amount: "2.000".parse().unwrap(),
                        method: "bKash".into(),
                        account_details: "01700000000".into(),
                        request_id: None,
                    },
                )
                .await
        }));
    }

    let mut ok = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(withdrawal) => {
                assert!(withdrawal.reserved);
                ok += 1;
            }
            Err(LedgerError::InsufficientFunds { .. }) => refused += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(ok, 2);
    assert_eq!(refused, 3);

    let stored = services.withdrawals.list(&admin()).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|w| w.reserved));
    assert_eq!(earnings(&services, "u1").await.millis(), 1000);
}
