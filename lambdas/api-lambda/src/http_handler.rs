use lambda_http::{
    http::{Method, StatusCode},
    Body, Error, Request, RequestExt, Response,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskhub_shared::auth::{Actor, Identity};
use taskhub_shared::http::{error_response, json_response, message_response, not_found};
use taskhub_shared::retry::with_backoff;
use taskhub_shared::settings::{AdSettings, DepositSettings};
use taskhub_shared::types::{
    BonusRequest, DepositDecision, DepositRequest, NewJob, ProofRequest, ReviewRequest,
    UpdateMembershipRequest, UpdateStatusRequest, User, VerificationDecision, VerificationSubmission,
    WithdrawalDecision, WithdrawalRequest,
};
use taskhub_shared::{AppState, LedgerError, Services};

#[derive(Deserialize)]
struct DecisionRequest<D> {
    decision: D,
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, LedgerError> {
    serde_json::from_slice(body).map_err(|e| LedgerError::InvalidInput(format!("malformed request body: {}", e)))
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T, LedgerError>) -> Result<Response<Body>, Error> {
    match result {
        Ok(value) => json_response(status, &value),
        Err(e) => error_response(&e),
    }
}

fn fresh_id(supplied: Option<String>) -> Option<String> {
    Some(supplied.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
}

/// Main Lambda handler - routes requests to the ledger operations
pub(crate) async fn function_handler(
    event: Request,
    state: Arc<AppState>,
) -> Result<Response<Body>, Error> {
    let method = event.method().clone();
    let path = event.uri().path().to_string();
    tracing::info!(method = %method, path = %path, "API request");

    // Handle CORS preflight
    if method == Method::OPTIONS {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET,POST,PUT,PATCH,DELETE,OPTIONS")
            .header(
                "Access-Control-Allow-Headers",
                "Content-Type,Authorization,X-User-Id",
            )
            .body(Body::Empty)
            .map_err(Box::new)?);
    }

    let Some(identity) = Identity::from_request(&event, state.services.config().allow_dev_headers) else {
        return message_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    };

    let services = &state.services;
    let policy = services.config().retry;
    let signed_in = with_backoff(&policy, "ensure_user", move || {
        services.users.ensure_user(identity.clone())
    })
    .await;
    let (actor, me) = match signed_in {
        Ok(pair) => pair,
        Err(e) => return error_response(&e),
    };

    let country = event
        .query_string_parameters_ref()
        .and_then(|params| params.first("country"))
        .map(|s| s.to_string());
    let parts: Vec<&str> = path.trim_matches('/').split('/').filter(|p| !p.is_empty()).collect();
    let body = event.body().as_ref();

    route(services, &actor, me, &method, parts.as_slice(), body, country.as_deref()).await
}

async fn route(
    services: &Services,
    actor: &Actor,
    me: User,
    method: &Method,
    parts: &[&str],
    body: &[u8],
    country: Option<&str>,
) -> Result<Response<Body>, Error> {
    let policy = &services.config().retry;
    let svc = services;

    match (method, parts) {
        // Users
        (&Method::GET, ["users", "me"]) => json_response(StatusCode::OK, &me),
        (&Method::GET, ["users"]) => respond(
            StatusCode::OK,
            with_backoff(policy, "list_users", move || svc.users.list_users(actor)).await,
        ),
        (&Method::PATCH, ["users", user_id, "status"]) => {
            let request: UpdateStatusRequest = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            let user_id: &str = user_id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "set_user_status", move || {
                    svc.users.set_user_status(actor, user_id, request.status)
                })
                .await,
            )
        }
        (&Method::PATCH, ["users", user_id, "membership"]) => {
            let request: UpdateMembershipRequest = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            let user_id: &str = user_id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "set_membership", move || {
                    svc.users.set_membership(actor, user_id, request.membership_level)
                })
                .await,
            )
        }

        // Jobs
        (&Method::GET, ["jobs"]) => respond(
            StatusCode::OK,
            with_backoff(policy, "list_jobs", move || svc.jobs.list_jobs(country)).await,
        ),
        (&Method::POST, ["jobs"]) => {
            let mut new_job: NewJob = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            // Fixed before the first attempt so a retried post funds one job
            new_job.request_id = fresh_id(new_job.request_id);
            respond(
                StatusCode::CREATED,
                with_backoff(policy, "post_job", move || svc.jobs.post_job(actor, new_job.clone())).await,
            )
        }
        (&Method::POST, ["jobs", job_id, "recover"]) => {
            let job_id: &str = job_id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "recover_job", move || svc.jobs.recover_job(actor, job_id)).await,
            )
        }
        (&Method::DELETE, ["jobs", job_id]) => {
            let job_id: &str = job_id;
            match with_backoff(policy, "delete_job", move || svc.jobs.delete_job(actor, job_id)).await {
                Ok(refunded) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "deleted": job_id, "refunded": refunded }),
                ),
                Err(LedgerError::NotFound { .. }) => not_found(),
                Err(e) => error_response(&e),
            }
        }

        // Submissions
        (&Method::POST, ["jobs", job_id, "submissions"]) => {
            let mut proof: ProofRequest = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            proof.request_id = fresh_id(proof.request_id);
            let job_id: &str = job_id;
            respond(
                StatusCode::CREATED,
                with_backoff(policy, "submit_proof", move || {
                    svc.reviews.submit_proof(actor, job_id, proof.clone())
                })
                .await,
            )
        }
        (&Method::GET, ["submissions"]) => respond(
            StatusCode::OK,
            with_backoff(policy, "list_submissions", move || svc.reviews.list_submissions(actor)).await,
        ),
        (&Method::GET, ["submissions", submission_id]) => {
            let submission_id: &str = submission_id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "get_submission", move || {
                    svc.reviews.get_submission(actor, submission_id)
                })
                .await,
            )
        }
        (&Method::POST, ["submissions", submission_id, "review"]) => {
            let request: ReviewRequest = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            // A retried review that already landed reports AlreadyReviewed;
            // settle recovers an interrupted one.
            respond(
                StatusCode::OK,
                svc.reviews.review(actor, submission_id, request.outcome).await,
            )
        }
        (&Method::POST, ["submissions", submission_id, "settle"]) => {
            let submission_id: &str = submission_id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "settle_submission", move || {
                    svc.reviews.settle_submission(actor, submission_id)
                })
                .await,
            )
        }
        (&Method::POST, ["submissions", "settle"]) => {
            match with_backoff(policy, "settle_pending", move || svc.reviews.settle_pending(actor)).await {
                Ok(results) => {
                    let summary: Vec<serde_json::Value> = results
                        .into_iter()
                        .map(|(id, result)| match result {
                            Ok(reviewed) => serde_json::json!({ "submission_id": id, "settled": reviewed.submission.settled }),
                            Err(e) => serde_json::json!({ "submission_id": id, "error": e.kind(), "message": e.to_string() }),
                        })
                        .collect();
                    json_response(StatusCode::OK, &summary)
                }
                Err(e) => error_response(&e),
            }
        }

        // Withdrawals
        (&Method::POST, ["withdrawals"]) => {
            let mut request: WithdrawalRequest = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            request.request_id = fresh_id(request.request_id);
            respond(
                StatusCode::CREATED,
                with_backoff(policy, "request_withdrawal", move || {
                    svc.withdrawals.request(actor, request.clone())
                })
                .await,
            )
        }
        (&Method::GET, ["withdrawals"]) => respond(
            StatusCode::OK,
            with_backoff(policy, "list_withdrawals", move || svc.withdrawals.list(actor)).await,
        ),
        (&Method::GET, ["withdrawals", id]) => {
            let id: &str = id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "get_withdrawal", move || svc.withdrawals.get(actor, id)).await,
            )
        }
        (&Method::POST, ["withdrawals", id, "decision"]) => {
            let request: DecisionRequest<WithdrawalDecision> = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            respond(StatusCode::OK, svc.withdrawals.decide(actor, id, request.decision).await)
        }
        (&Method::POST, ["withdrawals", id, "recover"]) => {
            let id: &str = id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "recover_withdrawal", move || svc.withdrawals.recover(actor, id)).await,
            )
        }

        // Deposits
        (&Method::POST, ["deposits"]) => {
            let mut request: DepositRequest = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            request.request_id = fresh_id(request.request_id);
            respond(
                StatusCode::CREATED,
                with_backoff(policy, "request_deposit", move || {
                    svc.deposits.request(actor, request.clone())
                })
                .await,
            )
        }
        (&Method::GET, ["deposits"]) => respond(
            StatusCode::OK,
            with_backoff(policy, "list_deposits", move || svc.deposits.list(actor)).await,
        ),
        (&Method::GET, ["deposits", id]) => {
            let id: &str = id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "get_deposit", move || svc.deposits.get(actor, id)).await,
            )
        }
        (&Method::POST, ["deposits", id, "decision"]) => {
            let request: DecisionRequest<DepositDecision> = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            respond(StatusCode::OK, svc.deposits.decide(actor, id, request.decision).await)
        }
        (&Method::POST, ["deposits", id, "recover"]) => {
            let id: &str = id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "recover_deposit", move || svc.deposits.recover(actor, id)).await,
            )
        }

        // Verifications
        (&Method::POST, ["verifications"]) => {
            let submission: VerificationSubmission = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            respond(
                StatusCode::CREATED,
                svc.verifications.submit(actor, submission).await,
            )
        }
        (&Method::GET, ["verifications"]) => respond(
            StatusCode::OK,
            with_backoff(policy, "list_verifications", move || svc.verifications.list(actor)).await,
        ),
        (&Method::GET, ["verifications", id]) => {
            let id: &str = id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "get_verification", move || svc.verifications.get(actor, id)).await,
            )
        }
        (&Method::POST, ["verifications", id, "decision"]) => {
            let request: DecisionRequest<VerificationDecision> = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            respond(StatusCode::OK, svc.verifications.decide(actor, id, request.decision).await)
        }
        (&Method::POST, ["verifications", id, "recover"]) => {
            let id: &str = id;
            respond(
                StatusCode::OK,
                with_backoff(policy, "recover_verification", move || svc.verifications.recover(actor, id)).await,
            )
        }

        // Bonus
        (&Method::POST, ["bonus"]) => {
            let mut request: BonusRequest = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            // Fixed before the first attempt so a retried broadcast cannot pay twice
            request.broadcast_id = fresh_id(request.broadcast_id);
            respond(
                StatusCode::OK,
                with_backoff(policy, "send_bonus", move || svc.bonus.send_bonus(actor, request.clone())).await,
            )
        }

        // Settings
        (&Method::GET, ["settings", "deposit"]) => respond(
            StatusCode::OK,
            with_backoff(policy, "get_deposit_settings", move || svc.settings.get::<DepositSettings>()).await,
        ),
        (&Method::PUT, ["settings", "deposit"]) => {
            let settings: DepositSettings = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            respond(
                StatusCode::OK,
                with_backoff(policy, "put_deposit_settings", move || svc.settings.put(actor, settings.clone())).await,
            )
        }
        (&Method::GET, ["settings", "ads"]) => respond(
            StatusCode::OK,
            with_backoff(policy, "get_ad_settings", move || svc.settings.get::<AdSettings>()).await,
        ),
        (&Method::PUT, ["settings", "ads"]) => {
            let settings: AdSettings = match parse_body(body) {
                Ok(r) => r,
                Err(e) => return error_response(&e),
            };
            respond(
                StatusCode::OK,
                with_backoff(policy, "put_ad_settings", move || svc.settings.put(actor, settings.clone())).await,
            )
        }

        _ => not_found(),
    }
}
