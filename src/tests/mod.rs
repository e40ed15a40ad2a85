//! Scenario tests across the RPC and transaction layers


mod rpc_manager_tests;
mod tx_manager_tests;
