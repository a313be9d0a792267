use crate::ops::Ops;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub ops: Ops,
    pub scheduler: Scheduler,
}
