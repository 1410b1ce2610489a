pub mod auth;
pub mod balance;
pub mod bonus;
pub mod config;
pub mod error;
pub mod http;
pub mod jobs;
pub mod ledger;
pub mod moderation;
pub mod money;
pub mod retry;
pub mod settings;
pub mod sockets;
pub mod store;
pub mod submissions;
pub mod types;
pub mod users;
pub mod view;

pub use error::{LedgerError, Result};
pub use money::Money;

use aws_sdk_apigatewaymanagement::Client as ApiGatewayManagementClient;
use aws_sdk_dynamodb::Client as DynamoClient;
use balance::BalanceEngine;
use bonus::BonusBroadcast;
use config::LedgerConfig;
use jobs::JobEngine;
use ledger::Ledger;
use moderation::{DepositQueue, VerificationQueue, WithdrawalQueue};
use settings::SettingsService;
use std::sync::Arc;
use store::{DynamoStore, LedgerStore};
use submissions::ReviewWorkflow;
use users::UserDirectory;

/// Every core operation, wired over one ledger.
#[derive(Clone)]
pub struct Services {
    pub ledger: Ledger,
    pub users: UserDirectory,
    pub balances: BalanceEngine,
    pub jobs: JobEngine,
    pub reviews: ReviewWorkflow,
    pub withdrawals: WithdrawalQueue,
    pub deposits: DepositQueue,
    pub verifications: VerificationQueue,
    pub bonus: BonusBroadcast,
    pub settings: SettingsService,
}

impl Services {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        let ledger = Ledger::new(store, config);
        let users = UserDirectory::new(ledger.clone());
        let balances = BalanceEngine::new(ledger.clone());
        let jobs = JobEngine::new(ledger.clone(), balances.clone());
        Self {
            reviews: ReviewWorkflow::new(ledger.clone(), jobs.clone()),
            withdrawals: WithdrawalQueue::new(ledger.clone(), balances.clone()),
            deposits: DepositQueue::new(ledger.clone(), balances.clone()),
            verifications: VerificationQueue::new(ledger.clone()),
            bonus: BonusBroadcast::new(ledger.clone(), users.clone(), balances.clone()),
            settings: SettingsService::new(ledger.clone()),
            users,
            balances,
            jobs,
            ledger,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        self.ledger.config()
    }
}

/// Shared application state
pub struct AppState {
    pub dynamo_client: DynamoClient,
    pub api_gateway_client: Option<ApiGatewayManagementClient>,
    pub services: Services,
}

impl AppState {
    pub fn new(
        dynamo_client: DynamoClient,
        api_gateway_client: Option<ApiGatewayManagementClient>,
        config: LedgerConfig,
    ) -> Arc<Self> {
        let store = DynamoStore::new(dynamo_client.clone(), config.table_name.clone());
        Arc::new(Self {
            services: Services::new(Arc::new(store), config),
            dynamo_client,
            api_gateway_client,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.services.config().table_name
    }
}
