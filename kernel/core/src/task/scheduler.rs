//! Cooperative round-robin scheduler.
//!
//! Processes run on their own kernel stacks and give up the CPU only in `yield_now`,
//! `block`, `check_point` or by returning. The table lock is never held across a
//! context switch.

use super::process::{
    AtomicProcessState, Pid, Process, ProcessInfo, ProcessName, ProcessStack, ProcessState,
    SpawnError,
};
use crate::arch::context;
use crate::consts::{MAX_PROCESSES, MIN_STACK_SIZE};
use crate::exec::ProgramImage;
use crate::panic::PANIC_CONTEXT;
use crate::time::Timer;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use cupid_api_types::{Errno, FsResult};

pub type ProcessBody = Box<dyn FnOnce(&ProcessContext) + Send>;

/// Handle passed to a running process body.
pub struct ProcessContext {
    scheduler: Arc<Scheduler>,
    pid: Pid,
}

impl ProcessContext {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn yield_now(&self) {
        self.scheduler.yield_now();
    }

    pub fn check_point(&self, timer: &Timer) {
        self.scheduler.check_point(timer);
    }

    pub fn kill_requested(&self) -> bool {
        self.scheduler.kill_requested(self.pid)
    }
}

struct Bootstrap {
    scheduler: Arc<Scheduler>,
    pid: Pid,
    body: ProcessBody,
}

/// First function run on every new process stack.
extern "C" fn process_start(arg: usize) -> ! {
    // Safety: `arg` came from `Box::into_raw` in `Scheduler::insert` and is consumed once.
    let bootstrap = unsafe { Box::from_raw(arg as *mut Bootstrap) };
    let Bootstrap { scheduler, pid, body } = *bootstrap;
    run_body(&scheduler, pid, body);
    Scheduler::exit_current(scheduler)
}

/// Everything the body owns is dropped before the process exits.
fn run_body(scheduler: &Arc<Scheduler>, pid: Pid, body: ProcessBody) {
    scheduler.reap();
    if scheduler.kill_requested(pid) {
        return;
    }
    let context = ProcessContext { scheduler: scheduler.clone(), pid };
    body(&context);
}

struct SchedState {
    table: Vec<Box<Process>>,
    current: Pid,
    next_pid: u32,
}

impl SchedState {
    fn index_of(&self, pid: Pid) -> Option<usize> {
        self.table.iter().position(|p| p.pid == pid)
    }

    fn current_index(&self) -> usize {
        match self.index_of(self.current) {
            Some(index) => index,
            None => panic!("scheduler: current pid {} missing from table", self.current),
        }
    }

    /// Next schedulable process after `from` in table order, excluding `from` itself.
    fn pick_next(&self, from: usize) -> Option<usize> {
        let len = self.table.len();
        (1..len)
            .map(|offset| (from + offset) % len)
            .find(|&index| self.table[index].is_schedulable())
    }

    fn check_canary(&self, index: usize) {
        let process = &self.table[index];
        if let Some(stack) = &process.stack
            && !stack.canary_intact()
        {
            log::error!("scheduler: stack canary of pid {} destroyed", process.pid);
            panic!("scheduler: stack overflow in pid {} ({})", process.pid, process.name);
        }
    }

    /// Makes `next` the running process. Returns where to save the current stack
    /// pointer and the stack pointer to resume.
    fn switch_to(&mut self, from: usize, next: usize) -> (*mut usize, usize) {
        self.check_canary(from);
        self.check_canary(next);
        if self.table[from].state() == ProcessState::Running {
            self.table[from].set_state(ProcessState::Runnable);
        }
        let target = &mut self.table[next];
        target.set_state(ProcessState::Running);
        target.switches += 1;
        self.current = target.pid;
        PANIC_CONTEXT.record_pid(target.pid.0);
        log::trace!("scheduler: {} -> {}", self.table[from].pid, self.current);
        let next_sp = self.table[next].saved_sp;
        (&raw mut self.table[from].saved_sp, next_sp)
    }
}

pub struct Scheduler {
    state: spin::Mutex<SchedState>,
}

impl Scheduler {
    /// Adopts the calling context as PID 1.
    pub fn new(init_name: &str) -> Arc<Self> {
        let init = Process {
            pid: Pid::INIT,
            name: ProcessName::try_from(init_name).unwrap_or_default(),
            state: AtomicProcessState::new(ProcessState::Running),
            kill_requested: AtomicBool::new(false),
            stack: None,
            saved_sp: 0,
            switches: 1,
            image: None,
        };
        PANIC_CONTEXT.record_pid(Pid::INIT.0);
        Arc::new(Self {
            state: spin::Mutex::new(SchedState {
                table: alloc::vec![Box::new(init)],
                current: Pid::INIT,
                next_pid: Pid::INIT.0 + 1,
            }),
        })
    }

    /// Creates a runnable process that will run `body` on a fresh stack.
    pub fn create(
        self: &Arc<Self>,
        name: &str,
        stack_size: usize,
        body: impl FnOnce(&ProcessContext) + Send + 'static,
    ) -> Result<Pid, SpawnError> {
        self.insert(name, stack_size, None, Box::new(body))
    }

    /// Creates a process that enters a loaded program image.
    pub fn create_image(
        self: &Arc<Self>,
        name: &str,
        stack_size: usize,
        image: ProgramImage,
    ) -> Result<Pid, SpawnError> {
        let image = Arc::new(image);
        let program = image.clone();
        let body = move |context: &ProcessContext| enter_image(context, &program);
        self.insert(name, stack_size, Some(image), Box::new(body))
    }

    fn insert(
        self: &Arc<Self>,
        name: &str,
        stack_size: usize,
        image: Option<Arc<ProgramImage>>,
        body: ProcessBody,
    ) -> Result<Pid, SpawnError> {
        if stack_size < MIN_STACK_SIZE {
            return Err(SpawnError::BadStackSize);
        }
        let name = ProcessName::try_from(name).map_err(|_| SpawnError::NameTooLong)?;
        self.reap();

        let mut state = self.state.lock();
        if state.table.len() >= MAX_PROCESSES {
            return Err(SpawnError::TableFull);
        }
        let mut stack = ProcessStack::new(stack_size)?;
        let pid = Pid(state.next_pid);
        state.next_pid += 1;

        let bootstrap = Box::new(Bootstrap { scheduler: self.clone(), pid, body });
        let saved_sp = context::prepare_stack(
            stack.memory_mut(),
            process_start,
            Box::into_raw(bootstrap) as usize,
        );
        log::debug!("scheduler: created pid {pid} ({name}), {stack_size} byte stack");
        state.table.push(Box::new(Process {
            pid,
            name,
            state: AtomicProcessState::new(ProcessState::Runnable),
            kill_requested: AtomicBool::new(false),
            stack: Some(stack),
            saved_sp,
            switches: 0,
            image,
        }));
        Ok(pid)
    }

    pub fn current(&self) -> Pid {
        self.state.lock().current
    }

    /// Switches to the next runnable process, returning when this one is scheduled
    /// again. Returns immediately if nothing else is runnable.
    pub fn yield_now(&self) {
        let switch = {
            let mut state = self.state.lock();
            let current = state.current_index();
            match state.pick_next(current) {
                Some(next) => Some(state.switch_to(current, next)),
                None if state.table[current].is_schedulable() => None,
                None => panic!("scheduler: no runnable process (pid {} blocked)", state.current),
            }
        };
        if let Some((prev_sp, next_sp)) = switch {
            // Safety: `prev_sp` points into a boxed process that stays in the table while
            // it is suspended, and `next_sp` was saved by `switch` or `prepare_stack`.
            unsafe { context::switch(prev_sp, next_sp) };
        }
        self.after_resume();
    }

    /// Runs on the way back into a process: frees finished processes and honours a
    /// pending kill.
    ///
    /// A killed process is not unwound: values owned by its frames are leaked.
    fn after_resume(&self) {
        self.reap();
        let (pid, killed) = {
            let state = self.state.lock();
            let current = &state.table[state.current_index()];
            (current.pid, current.kill_requested.load(Ordering::Acquire))
        };
        if killed && pid != Pid::INIT {
            log::debug!("scheduler: pid {pid} observed kill");
            self.terminate_current();
        }
    }

    /// Frees the stacks of every zombie except the running process.
    fn reap(&self) {
        let reaped: Vec<Box<Process>> = {
            let mut state = self.state.lock();
            let current = state.current;
            let (dead, live) = core::mem::take(&mut state.table)
                .into_iter()
                .partition(|p| p.pid != current && p.state() == ProcessState::Zombie);
            state.table = live;
            dead
        };
        for process in &reaped {
            log::debug!("scheduler: reaped pid {} ({})", process.pid, process.name);
        }
    }

    /// Ends the running process. Its stack is freed by the next process to resume.
    fn exit_current(this: Arc<Self>) -> ! {
        let (prev_sp, next_sp) = this.zombify_current();
        drop(this);
        // Safety: as in `yield_now`; the zombie's stack stays allocated until the
        // process we switch to reaps it.
        unsafe { context::switch(prev_sp, next_sp) };
        unreachable!("scheduler: zombie process resumed")
    }

    fn terminate_current(&self) -> ! {
        let (prev_sp, next_sp) = self.zombify_current();
        unsafe { context::switch(prev_sp, next_sp) };
        unreachable!("scheduler: zombie process resumed")
    }

    fn zombify_current(&self) -> (*mut usize, usize) {
        let mut state = self.state.lock();
        let current = state.current_index();
        if state.current == Pid::INIT {
            panic!("scheduler: pid 1 tried to exit");
        }
        state.table[current].set_state(ProcessState::Zombie);
        log::debug!("scheduler: pid {} exited", state.current);
        let Some(next) = state.pick_next(current) else {
            panic!("scheduler: no runnable process after pid {} exited", state.current);
        };
        state.switch_to(current, next)
    }

    /// Asks `pid` to terminate at its next yield or check point.
    pub fn kill(&self, pid: Pid) -> FsResult<()> {
        if pid == Pid::INIT {
            return Err(Errno::Busy);
        }
        let state = self.state.lock();
        let process = state
            .index_of(pid)
            .map(|index| &state.table[index])
            .filter(|p| p.state() != ProcessState::Zombie)
            .ok_or(Errno::NotFound)?;
        process.kill_requested.store(true, Ordering::Release);
        if process.state() == ProcessState::Blocked {
            process.set_state(ProcessState::Runnable);
        }
        log::info!("scheduler: kill requested for pid {pid} ({})", process.name);
        Ok(())
    }

    pub fn kill_requested(&self, pid: Pid) -> bool {
        let state = self.state.lock();
        state
            .index_of(pid)
            .is_some_and(|index| state.table[index].kill_requested.load(Ordering::Acquire))
    }

    /// Marks `pid` blocked. Blocking the running process yields immediately.
    pub fn block(&self, pid: Pid) -> FsResult<()> {
        let is_current = {
            let state = self.state.lock();
            let index = state.index_of(pid).ok_or(Errno::NotFound)?;
            let process = &state.table[index];
            if !process.is_schedulable() {
                return Err(Errno::InvalidArgument);
            }
            process.set_state(ProcessState::Blocked);
            pid == state.current
        };
        if is_current {
            self.yield_now();
        }
        Ok(())
    }

    pub fn wake(&self, pid: Pid) -> FsResult<()> {
        let state = self.state.lock();
        let index = state.index_of(pid).ok_or(Errno::NotFound)?;
        let process = &state.table[index];
        match process.state() {
            ProcessState::Blocked => {
                process.set_state(ProcessState::Runnable);
                Ok(())
            }
            ProcessState::Zombie => Err(Errno::NotFound),
            _ => Ok(()),
        }
    }

    /// Cooperative check point for long-running kernel work: yields if the timer asked
    /// for a reschedule, and terminates the caller if it was killed.
    pub fn check_point(&self, timer: &Timer) {
        if timer.take_reschedule() {
            self.yield_now();
        } else {
            self.after_resume();
        }
    }

    fn others_runnable(&self) -> bool {
        let state = self.state.lock();
        let current = state.current;
        state.table.iter().any(|p| p.pid != current && p.is_schedulable())
    }

    /// Yields until no other process is runnable.
    pub fn run_until_idle(&self) {
        while self.others_runnable() {
            self.yield_now();
        }
        self.reap();
    }

    /// Idles with `idle` (typically `hlt`) until another process becomes runnable,
    /// then yields to it.
    pub fn wait_runnable(&self, mut idle: impl FnMut()) {
        while !self.others_runnable() {
            idle();
        }
        self.yield_now();
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.state.lock().table.iter().map(|p| p.info()).collect()
    }

    pub fn info(&self, pid: Pid) -> Option<ProcessInfo> {
        let state = self.state.lock();
        state.index_of(pid).map(|index| state.table[index].info())
    }

    pub fn image(&self, pid: Pid) -> Option<Arc<ProgramImage>> {
        let state = self.state.lock();
        state.index_of(pid).and_then(|index| state.table[index].image.clone())
    }

    #[cfg(test)]
    fn smash_stack(&self, pid: Pid) {
        let mut state = self.state.lock();
        let index = state.index_of(pid).unwrap();
        state.table[index].stack.as_mut().unwrap().smash();
    }
}

#[cfg(target_os = "none")]
fn enter_image(context: &ProcessContext, image: &ProgramImage) {
    log::info!("exec: pid {} entering {:#x}", context.pid(), image.entry());
    // Safety: the user window is identity mapped and owned by the running program
    // while it runs; programs are cooperative and return to us.
    unsafe {
        image.install();
        let entry: extern "C" fn() = core::mem::transmute(image.entry() as usize);
        entry();
    }
}

/// Hosted builds cannot execute i386 user code; the process only records its start.
#[cfg(not(target_os = "none"))]
fn enter_image(context: &ProcessContext, image: &ProgramImage) {
    log::info!(
        "exec: pid {} would enter {:#x} ({} bytes mapped)",
        context.pid(),
        image.entry(),
        image.memory_size()
    );
}

#[cfg(all(test, any(target_arch = "x86", target_arch = "x86_64")))]
mod tests {
    use super::*;
    use crate::consts::DEFAULT_STACK_SIZE;
    use cupid_api_types::elf::CODE_BASE;
    use std::sync::Mutex;
    use std::vec;

    fn log() -> Arc<Mutex<Vec<u32>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn round_robin_fairness() {
        const K: usize = 4;
        const M: usize = 5;
        let scheduler = Scheduler::new("init");
        let seen = log();
        for i in 0..K {
            let seen = seen.clone();
            scheduler
                .create(&std::format!("p{i}"), DEFAULT_STACK_SIZE, move |ctx| {
                    for _ in 0..M {
                        seen.lock().unwrap().push(ctx.pid().0);
                        ctx.yield_now();
                    }
                })
                .unwrap();
        }
        scheduler.run_until_idle();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), K * M);
        for pid in 2..2 + K as u32 {
            assert_eq!(seen.iter().filter(|&&p| p == pid).count(), M);
        }
        // Strict rotation: every window of K entries holds each process once.
        for window in seen.chunks(K) {
            let mut sorted = window.to_vec();
            sorted.sort();
            assert_eq!(sorted, (2..2 + K as u32).collect::<Vec<_>>());
        }
        assert_eq!(scheduler.processes().len(), 1);
    }

    #[test]
    fn yield_without_others_returns() {
        let scheduler = Scheduler::new("init");
        scheduler.yield_now();
        assert_eq!(scheduler.current(), Pid::INIT);
    }

    #[test]
    fn kill_takes_effect_at_next_yield() {
        let scheduler = Scheduler::new("init");
        let seen = log();
        let inner = seen.clone();
        let pid = scheduler
            .create("spinner", DEFAULT_STACK_SIZE, move |ctx| {
                loop {
                    inner.lock().unwrap().push(1);
                    ctx.yield_now();
                }
            })
            .unwrap();
        scheduler.yield_now();
        scheduler.yield_now();
        assert_eq!(seen.lock().unwrap().len(), 2);

        scheduler.kill(pid).unwrap();
        assert!(scheduler.info(pid).unwrap().kill_requested);
        scheduler.run_until_idle();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(scheduler.info(pid).is_none());
        assert_eq!(scheduler.kill(pid), Err(Errno::NotFound));
    }

    #[test]
    fn kill_before_first_run_skips_body() {
        let scheduler = Scheduler::new("init");
        let seen = log();
        let inner = seen.clone();
        let pid = scheduler
            .create("never", DEFAULT_STACK_SIZE, move |_| inner.lock().unwrap().push(1))
            .unwrap();
        scheduler.kill(pid).unwrap();
        scheduler.run_until_idle();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(scheduler.processes().len(), 1);
    }

    #[test]
    fn pid_one_cannot_be_killed() {
        let scheduler = Scheduler::new("init");
        assert_eq!(scheduler.kill(Pid::INIT), Err(Errno::Busy));
        assert_eq!(scheduler.kill(Pid(42)), Err(Errno::NotFound));
    }

    #[test]
    fn block_and_wake() {
        let scheduler = Scheduler::new("init");
        let seen = log();
        let inner = seen.clone();
        let pid = scheduler
            .create("sleeper", DEFAULT_STACK_SIZE, move |ctx| {
                inner.lock().unwrap().push(1);
                ctx.scheduler().block(ctx.pid()).unwrap();
                inner.lock().unwrap().push(2);
            })
            .unwrap();
        scheduler.run_until_idle();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(scheduler.info(pid).unwrap().state, ProcessState::Blocked);

        scheduler.wake(pid).unwrap();
        scheduler.run_until_idle();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(scheduler.wake(pid), Err(Errno::NotFound));
    }

    #[test]
    fn check_point_yields_only_after_a_tick() {
        let scheduler = Scheduler::new("init");
        let timer = Timer::new(100);
        let seen = log();
        let inner = seen.clone();
        scheduler
            .create("worker", DEFAULT_STACK_SIZE, move |_| inner.lock().unwrap().push(7))
            .unwrap();
        scheduler.check_point(&timer);
        assert!(seen.lock().unwrap().is_empty());
        timer.on_tick();
        scheduler.check_point(&timer);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn create_rejects_bad_requests() {
        let scheduler = Scheduler::new("init");
        assert_eq!(scheduler.create("tiny", 128, |_| {}).err(), Some(SpawnError::BadStackSize));
        let long = "n".repeat(40);
        assert_eq!(
            scheduler.create(&long, DEFAULT_STACK_SIZE, |_| {}).err(),
            Some(SpawnError::NameTooLong)
        );
        for _ in 1..MAX_PROCESSES {
            scheduler.create("filler", MIN_STACK_SIZE * 4, |_| {}).unwrap();
        }
        assert_eq!(
            scheduler.create("one-too-many", MIN_STACK_SIZE * 4, |_| {}).err(),
            Some(SpawnError::TableFull)
        );
        scheduler.run_until_idle();
        assert!(scheduler.create("again", MIN_STACK_SIZE * 4, |_| {}).is_ok());
        scheduler.run_until_idle();
    }

    #[test]
    fn processes_snapshot() {
        let scheduler = Scheduler::new("shell");
        let pid = scheduler.create("worker", DEFAULT_STACK_SIZE, |_| {}).unwrap();
        let list = scheduler.processes();
        assert_eq!(list[0].pid, Pid::INIT);
        assert_eq!(list[0].name, "shell");
        assert_eq!(list[0].state, ProcessState::Running);
        assert_eq!(list[1].pid, pid);
        assert_eq!(list[1].state, ProcessState::Runnable);
        scheduler.run_until_idle();
    }

    #[test]
    fn image_processes_expose_their_entry() {
        let scheduler = Scheduler::new("init");
        let file = crate::exec::write(&[0xF4], &[], 0).unwrap();
        let image = crate::exec::load(&file).unwrap();
        let pid = scheduler.create_image("hlt", DEFAULT_STACK_SIZE, image).unwrap();
        assert_eq!(scheduler.info(pid).unwrap().entry, Some(CODE_BASE));
        assert_eq!(scheduler.image(pid).unwrap().read(CODE_BASE, 1), Some(&[0xF4][..]));
        scheduler.run_until_idle();
    }

    #[test]
    #[should_panic(expected = "stack overflow")]
    fn destroyed_canary_is_fatal() {
        let scheduler = Scheduler::new("init");
        let pid = scheduler.create("victim", DEFAULT_STACK_SIZE, |_| {}).unwrap();
        scheduler.smash_stack(pid);
        scheduler.yield_now();
    }
}
