//! Grafo de definición: estados, transiciones, expresiones y registro.

pub mod expr;
pub mod machine;
pub mod repository;
pub mod state;

pub use expr::{is_truthy, ArithOp, CmpOp, EvalScope, Expr};
pub use machine::{RecoverStrategy, StateMachine, StateMachineBuilder};
pub use repository::{InMemoryStateMachineRepository, StateMachineRepository};
pub use state::{Catch, ChoiceBranch, EndKind, PersistMode, RetryRule, State, StateKind, StateType, StatusRule};
