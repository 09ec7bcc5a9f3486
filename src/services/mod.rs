pub mod discovery_service;
pub mod eligibility_service;
pub mod inventory_service;
pub mod mining_service;
pub mod platform;
pub mod ranker_service;
pub mod twitch_gql_service;
pub mod watch_service;
