//! # ledger-vm: the contract execution layer of a ledger node
//!
//! - ledger-vm takes a block's transactions, runs them against the state committed by the parent
//!   block, and produces receipts plus a new state root. Contract code is bytecode run by a
//!   pluggable interpreter; protocol contracts (validator set, difficulty) are native Rust.
//!
//! # Overview
//! The crate is organized so that each module does one thing:
//!
//! - [core]: the [Executor](core/exec/struct.Executor.html) that dispatches one transaction's call
//!   tree (transfer, deploy, call, coinbase), the gas/step [Limit](core/limit/struct.Limit.html),
//!   the host functions contract bytecode can call, and the contract with the interpreter
//!   ([Interpreter](core/trait.Interpreter.html)/[Instance](core/trait.Instance.html)).
//! - [state]: the layered copy-on-write [Backend](state/struct.Backend.html) and the interface to
//!   the persistent trie store.
//! - [builtin]: native contracts and coinbase ("bios") hooks.
//! - [tx]: the transaction envelope.
//! - [processor]: applies transactions and blocks, builds genesis.
//! - [common]: basic types.
//!
//! Running a transaction takes a few steps:
//!
//! - Build a [TxExecEnv](core/struct.TxExecEnv.html) with an interpreter and the native contracts.
//! - Open a [Backend](state/struct.Backend.html) on the parent block's state root.
//! - Call [Executor::execute](core/exec/struct.Executor.html#method.execute) (or
//!   [processor::run_single_tx]) and finally [Backend::merge](state/struct.Backend.html#method.merge)
//!   to commit. [processor::apply_block] does all of it for a block.
//!
//! # State Layers
//!
//! Nothing is journaled. Every transaction and every nested call pushes a fresh layer on the
//! backend and writes only to it; reads walk down the layers and end at the trie. A failed call
//! is undone by popping its layer, a successful one is folded into its parent. Only
//! `merge()` at the end of a block touches the store, so the trie sees one batch of writes per
//! block, and a static (read-only) backend can serve view calls against any committed root
//! without risk of changing it.
//!
//! # Gas
//!
//! A single [Limit](core/limit/struct.Limit.html) is shared by the whole call tree of a
//! transaction. It counts interpreter steps and host calls at a fine granularity; gas is steps
//! divided by a fixed multiplier. Running out anywhere aborts the whole transaction: its state
//! changes are discarded but the sender still pays for the gas burnt and its nonce moves on.

#[macro_use] extern crate num_derive;

#[macro_use]
pub mod common;
pub mod builtin;
pub mod core;
pub mod processor;
pub mod state;
pub mod tx;
