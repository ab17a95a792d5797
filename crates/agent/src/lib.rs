//! The Codeward agent: a ReAct loop over a coding workspace.
//!
//! The agent follows a **Thought → Action → Observation** cycle:
//!
//! 1. **Receive** a user request and append it to the session
//! 2. **Plan** (optional): one reasoning-only call whose plan is injected
//!    into later payloads
//! 3. **Build context** from the session store under the token budget
//! 4. **Call the model**; if it asks for tools, run each through the mode
//!    check, the approval gate and the dispatcher, append the results, loop
//! 5. **Finish** when the model answers without tools, or stop `Incomplete`
//!    at the iteration cap
//!
//! [`Runtime`] wires every component together and serializes runs per
//! session; [`Orchestrator`] is the loop itself.

pub mod orchestrator;
pub mod runtime;
pub mod testing;

pub use orchestrator::{Orchestrator, RunOutcome};
pub use runtime::{Runtime, RuntimeBuilder};
