mod rpc_reader;
mod runner;
