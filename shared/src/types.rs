use crate::ledger::Entity;
use crate::money::Money;
use crate::store::Collection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ========== USER ==========
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum MembershipLevel {
    #[default]
    Free,
    Silver,
    Gold,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserStatus {
    #[default]
    Active,
    Banned,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationStatus {
    #[default]
    Unverified,
    Pending,
    Verified,
    Rejected,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub country: Option<String>,
    pub earnings: Money,
    pub deposit: Money,
    pub membership_level: MembershipLevel,
    pub status: UserStatus,
    /// Mirror of the admin policy at last sign-in, for display only.
    pub is_admin: bool,
    pub verification_status: VerificationStatus,
    pub active_verification: Option<String>,
    pub joined_at: String,
}

impl User {
    pub fn is_banned(&self) -> bool {
        self.status == UserStatus::Banned
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: UserStatus,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMembershipRequest {
    pub membership_level: MembershipLevel,
}

// ========== JOB ==========
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum JobCategory {
    YouTube,
    Facebook,
    Instagram,
    #[serde(rename = "Sign Up")]
    SignUp,
    Telegram,
    #[serde(rename = "Ads Post")]
    AdsPost,
    #[serde(rename = "Data Entry")]
    DataEntry,
    #[serde(rename = "Graphics Design")]
    GraphicsDesign,
    #[serde(rename = "Short Link")]
    ShortLink,
    Application,
    Other,
}

impl JobCategory {
    /// Smallest payout a poster may offer per completion.
    pub fn min_payout(&self) -> Money {
        match self {
            JobCategory::Application => Money::from_millis(80),
            _ => Money::from_millis(10),
        }
    }
}

pub const INTERNATIONAL: &str = "International";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub poster_id: String,
    pub title: String,
    pub category: JobCategory,
    pub payout: Money,
    pub completed_count: u32,
    pub max_count: u32,
    pub target_country: String,
    pub is_top_job: bool,
    pub instructions: Option<String>,
    pub thumbnail: Option<String>,
    /// Units of work already counted; never longer than `max_count`.
    #[serde(default)]
    pub completed_units: BTreeSet<String>,
    /// Set once `payout × max_count` has been taken from the poster's deposit.
    #[serde(default)]
    pub funded: bool,
    /// Closed jobs accept no further completions.
    #[serde(default)]
    pub closed: bool,
    pub created_at: String,
}

impl Job {
    /// Funded and not closed.
    pub fn is_open(&self) -> bool {
        self.funded && !self.closed
    }

    pub fn is_full(&self) -> bool {
        self.completed_count >= self.max_count
    }

    pub fn remaining(&self) -> u32 {
        self.max_count.saturating_sub(self.completed_count)
    }

    pub fn is_visible_in(&self, country: &str) -> bool {
        self.target_country == INTERNATIONAL || (country != INTERNATIONAL && self.target_country == country)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NewJob {
    pub title: String,
    pub category: JobCategory,
    pub payout: Money,
    pub max_count: u32,
    #[serde(default = "default_target_country")]
    pub target_country: String,
    #[serde(default)]
    pub is_top_job: bool,
    pub instructions: Option<String>,
    pub thumbnail: Option<String>,
    /// Client-chosen job id, so a retried post funds one job only.
    pub request_id: Option<String>,
}

fn default_target_country() -> String {
    INTERNATIONAL.to_string()
}

// ========== SUBMISSION ==========
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Submission {
    pub submission_id: String,
    pub job_id: String,
    pub worker_id: String,
    pub proof_text: String,
    pub proof_image: Option<String>,
    pub status: SubmissionStatus,
    /// Set once the approved unit has been counted and paid.
    #[serde(default)]
    pub settled: bool,
    pub submitted_at: String,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProofRequest {
    pub proof_text: String,
    pub proof_image: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    Approved,
    Rejected,
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub outcome: ReviewOutcome,
}

// ========== WITHDRAWAL ==========
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Withdrawal {
    pub withdrawal_id: String,
    pub user_id: String,
    pub amount: Money,
    pub method: String,
    pub account_details: String,
    pub status: WithdrawalStatus,
    /// Set once the amount has been taken from the user's earnings.
    #[serde(default)]
    pub reserved: bool,
    pub requested_at: String,
    pub decided_at: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WithdrawalRequest {
    pub amount: Money,
    pub method: String,
    pub account_details: String,
    /// Client-chosen id that makes a re-issued request safe.
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalDecision {
    Approved,
    Rejected,
}

// ========== DEPOSIT ==========
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DepositStatus {
    Completed,
    Pending,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Deposit {
    pub deposit_id: String,
    pub user_id: String,
    pub amount: Money,
    pub method: String,
    pub account_details: Option<String>,
    pub status: DepositStatus,
    pub requested_at: String,
    pub decided_at: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DepositRequest {
    pub amount: Money,
    pub method: String,
    pub account_details: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DepositDecision {
    Completed,
    Failed,
}

// ========== VERIFICATION ==========
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum VerificationRequestStatus {
    Pending,
    Verified,
    Rejected,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VerificationRequest {
    pub request_id: String,
    pub user_id: String,
    pub document_type: String,
    pub image_url: String,
    pub status: VerificationRequestStatus,
    pub submitted_at: String,
    pub decided_at: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerificationSubmission {
    pub document_type: String,
    pub image_url: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum VerificationDecision {
    Verified,
    Rejected,
}

// ========== BONUS ==========
#[derive(Debug, Deserialize, Clone)]
pub struct BonusRequest {
    /// A user id, an email, or `ALL`.
    pub target: String,
    pub amount: Money,
    pub broadcast_id: Option<String>,
    /// Restrict a retried broadcast to these user ids.
    pub only_users: Option<Vec<String>>,
}

macro_rules! impl_entity {
    ($ty:ty, $collection:expr, $name:literal, $id:ident) => {
        impl Entity for $ty {
            const COLLECTION: Collection = $collection;
            const NAME: &'static str = $name;

            fn id(&self) -> &str {
                &self.$id
            }
        }
    };
}

impl_entity!(User, Collection::Users, "user", user_id);
impl_entity!(Job, Collection::Jobs, "job", job_id);
impl_entity!(Submission, Collection::Submissions, "submission", submission_id);
impl_entity!(Withdrawal, Collection::Withdrawals, "withdrawal", withdrawal_id);
impl_entity!(Deposit, Collection::Deposits, "deposit", deposit_id);
impl_entity!(VerificationRequest, Collection::Verifications, "verification", request_id);

macro_rules! impl_status_display {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        })*
    };
}

impl_status_display!(
    SubmissionStatus,
    WithdrawalStatus,
    DepositStatus,
    VerificationRequestStatus,
    UserStatus,
    MembershipLevel
);
