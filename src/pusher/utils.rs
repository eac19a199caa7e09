pub mod rpc_multi_client;
