mod backtrack;
mod builder;
mod bytecode;
mod choice;
mod classes;
mod config;
mod error;
mod fields;
mod gc;
mod handle;
mod heap;
mod interpreter;
mod kernel;
mod listener;
mod method;
mod monitor;
mod object;
mod scenarios;
mod scheduler;
mod search;
mod serializer;
mod stack;
mod state_set;
mod sync;
mod system;
mod thread_list;
mod threads;
mod trace;

pub use backtrack::*;
pub use builder::*;
pub use bytecode::*;
pub use choice::*;
pub use classes::*;
pub use config::*;
pub use error::*;
pub use fields::*;
pub use gc::*;
pub use handle::*;
pub use heap::*;
pub use interpreter::ExecContext;
pub use kernel::*;
pub use listener::*;
pub use method::*;
pub use monitor::*;
pub use object::*;
pub use scenarios::*;
pub use scheduler::*;
pub use search::*;
pub use serializer::*;
pub use stack::*;
pub use state_set::*;
pub use system::*;
pub use thread_list::*;
pub use threads::*;
pub use trace::*;
