pub mod abi;
pub mod patcher;
pub mod preempt;
