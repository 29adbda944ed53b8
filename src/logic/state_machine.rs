//! Session state machine.
//!
//! Runs at a fixed tick rate. Every tick reads the latest face snapshot and
//! MCU telemetry, advances the session, and emits one complete command
//! record. Session rules the rest of the system relies on:
//!
//! - a session runs from the door opening (INACTIVE exit) to the next
//!   INACTIVE entry, and pours at most once;
//! - the ALIVE/DEAD outcome is drawn once, on COLLAPSE entry;
//! - `dispensing_enabled` gates every emitted valve bit, manual overrides
//!   included;
//! - losing the MCU link preempts everything (FAULT), losing the camera
//!   ends the session.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::comm::protocol::{CommandRecord, CMD_FLAG_LED_TEST, NUM_SERVOS};
use crate::config::Config;
use crate::logic::animation::{drift_toward, square_wave, ArmWave, Shake, SERVO_CENTER};
use crate::logic::behaviors;
use crate::state::{AppState, FaceSnapshot, Telemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Collapse,
    Alive,
    Dead,
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Alive,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveBehavior {
    Entry,
    Idle,
    Detected,
    Dispensing,
    DispenseReject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadBehavior {
    Entry,
    Normal,
    Reject,
}

/// Out-of-band operator controls, delivered over a channel and applied at
/// the top of the next tick.
#[derive(Debug, Clone, Copy)]
pub enum OperatorCommand {
    ForceCollapse,
    ForceInactive,
    SkipAnimation,
    EmergencyStop,
    EnableDispensing,
    SetForcedOutcome(Option<Outcome>),
    OpenValve,
    CloseValve,
    TriggerLedTest,
}

pub struct StateMachine {
    config: Config,
    rng: StdRng,

    state: SessionState,
    state_entry: Instant,
    outcome: Outcome,
    alive_behavior: AliveBehavior,
    dead_behavior: DeadBehavior,

    /// Latched when a pour begins; cleared only on INACTIVE entry.
    has_dispensed: bool,
    tracking_base: f32,
    arm: ArmWave,
    shake: Shake,

    dispense_start: Option<Instant>,
    reject_start: Option<Instant>,
    limit_hold_start: Option<Instant>,
    dark_start: Option<Instant>,
    light_start: Option<Instant>,

    forced_outcome: Option<Outcome>,
    skip_requested: bool,
    dispensing_enabled: bool,
    manual_valve_open: bool,
    manual_valve_time: Option<Instant>,
    led_test_until: Option<Instant>,
}

impl StateMachine {
    pub fn new(config: Config) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: Config, rng: StdRng) -> Self {
        Self {
            config,
            rng,
            state: SessionState::Inactive,
            state_entry: Instant::now(),
            outcome: Outcome::Dead,
            alive_behavior: AliveBehavior::Entry,
            dead_behavior: DeadBehavior::Entry,
            has_dispensed: false,
            tracking_base: SERVO_CENTER,
            arm: ArmWave::new(),
            shake: Shake::new(),
            dispense_start: None,
            reject_start: None,
            limit_hold_start: None,
            dark_start: None,
            light_start: None,
            forced_outcome: None,
            skip_requested: false,
            dispensing_enabled: true,
            manual_valve_open: false,
            manual_valve_time: None,
            led_test_until: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn alive_behavior(&self) -> AliveBehavior {
        self.alive_behavior
    }

    pub fn dead_behavior(&self) -> DeadBehavior {
        self.dead_behavior
    }

    pub fn has_dispensed(&self) -> bool {
        self.has_dispensed
    }

    pub fn dispensing_enabled(&self) -> bool {
        self.dispensing_enabled
    }

    pub fn tracking_base(&self) -> f32 {
        self.tracking_base
    }

    pub fn apply(&mut self, command: OperatorCommand, now: Instant) {
        match command {
            OperatorCommand::ForceCollapse => {
                if self.state != SessionState::Fault {
                    info!("Operator: force collapse");
                    self.enter(SessionState::Collapse, now);
                }
            }
            OperatorCommand::ForceInactive => {
                info!("Operator: force inactive");
                self.enter(SessionState::Inactive, now);
            }
            OperatorCommand::SkipAnimation => self.skip_requested = true,
            OperatorCommand::EmergencyStop => {
                warn!("Operator: emergency stop, dispensing disabled");
                self.dispensing_enabled = false;
                self.manual_valve_open = false;
                self.manual_valve_time = None;
            }
            OperatorCommand::EnableDispensing => {
                info!("Operator: dispensing enabled");
                self.dispensing_enabled = true;
            }
            OperatorCommand::SetForcedOutcome(outcome) => self.forced_outcome = outcome,
            OperatorCommand::OpenValve => {
                self.manual_valve_open = true;
                self.manual_valve_time = Some(now);
            }
            OperatorCommand::CloseValve => {
                self.manual_valve_open = false;
                self.manual_valve_time = None;
            }
            OperatorCommand::TriggerLedTest => {
                self.led_test_until = Some(now + Duration::from_secs(1));
            }
        }
    }

    /// One tick: read snapshots, advance the session, emit the command set.
    pub fn tick(
        &mut self,
        face: &FaceSnapshot,
        telemetry: &Telemetry,
        now: Instant,
    ) -> CommandRecord {
        self.update_door_timers(face, now);
        self.step_transitions(face, telemetry, now);
        let mut cmd = self.emit(face, telemetry, now);

        // Manual valve override runs one pour length, then clears itself.
        if self.manual_valve_open {
            if let Some(opened) = self.manual_valve_time {
                if now.duration_since(opened) >= self.config.session.pour_duration() {
                    self.manual_valve_open = false;
                    self.manual_valve_time = None;
                }
            }
        }

        // LED test flag stays up until the MCU confirms or the latch times
        // out, so the change-triggered FLG line carries one rising edge.
        if let Some(until) = self.led_test_until {
            if telemetry.test_active || now >= until {
                self.led_test_until = None;
            } else {
                cmd.flags |= CMD_FLAG_LED_TEST;
            }
        }

        // The interlock: nothing opens the valve while dispensing is
        // disabled, manual override included.
        cmd.valve_open = (cmd.valve_open || self.manual_valve_open) && self.dispensing_enabled;
        cmd.emergency_stop = !self.dispensing_enabled;
        cmd
    }

    /// Track how long the current run of lit / dark frames has lasted.
    fn update_door_timers(&mut self, face: &FaceSnapshot, now: Instant) {
        if !face.camera_connected {
            self.light_start = None;
            self.dark_start = None;
        } else if face.is_dark {
            self.dark_start.get_or_insert(now);
            self.light_start = None;
        } else {
            self.light_start.get_or_insert(now);
            self.dark_start = None;
        }
    }

    fn sustained(since: Option<Instant>, now: Instant, needed: Duration) -> bool {
        since.is_some_and(|start| now.duration_since(start) >= needed)
    }

    fn step_transitions(&mut self, face: &FaceSnapshot, telemetry: &Telemetry, now: Instant) {
        // MCU link loss preempts everything.
        if !telemetry.connected {
            if self.state != SessionState::Fault {
                warn!("MCU link lost, entering fault state");
                self.enter(SessionState::Fault, now);
            }
            return;
        }
        if self.state == SessionState::Fault {
            if self.dispensing_enabled {
                info!("MCU link restored");
                self.enter(SessionState::Inactive, now);
            }
            return;
        }

        // Without a camera no session can continue.
        if self.state != SessionState::Inactive && !face.camera_connected {
            warn!("Camera lost, ending session");
            self.enter(SessionState::Inactive, now);
            return;
        }

        match self.state {
            SessionState::Inactive => {
                if face.camera_connected
                    && Self::sustained(self.light_start, now, self.config.session.light_to_collapse())
                {
                    self.enter(SessionState::Collapse, now);
                }
            }
            SessionState::Collapse => {
                let expired = now.duration_since(self.state_entry)
                    >= self.config.session.collapse_duration();
                if expired || self.skip_requested {
                    self.skip_requested = false;
                    match self.outcome {
                        Outcome::Alive => self.enter(SessionState::Alive, now),
                        Outcome::Dead => self.enter(SessionState::Dead, now),
                    }
                }
            }
            SessionState::Alive | SessionState::Dead => {
                if Self::sustained(self.dark_start, now, self.config.session.dark_to_inactive()) {
                    self.enter(SessionState::Inactive, now);
                }
            }
            SessionState::Fault => unreachable!("fault handled above"),
        }
    }

    fn enter(&mut self, next: SessionState, now: Instant) {
        debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.state_entry = now;
        match next {
            SessionState::Inactive => {
                // The only place the per-session dispense latch resets.
                self.has_dispensed = false;
                self.dispense_start = None;
                self.reject_start = None;
                self.light_start = None;
                self.limit_hold_start = None;
                self.tracking_base = SERVO_CENTER;
            }
            SessionState::Collapse => {
                self.outcome = match self.forced_outcome.take() {
                    Some(outcome) => outcome,
                    None => {
                        if self.rng.gen_bool(self.config.session.alive_probability) {
                            Outcome::Alive
                        } else {
                            Outcome::Dead
                        }
                    }
                };
                info!("Collapse started, outcome will be {:?}", self.outcome);
            }
            SessionState::Alive => {
                self.alive_behavior = AliveBehavior::Entry;
                // Greeting: one wave cycle right away.
                self.arm.start(&self.config.animation);
            }
            SessionState::Dead => {
                self.dead_behavior = DeadBehavior::Entry;
            }
            SessionState::Fault => {}
        }
    }

    fn emit(&mut self, face: &FaceSnapshot, telemetry: &Telemetry, now: Instant) -> CommandRecord {
        match self.state {
            SessionState::Inactive => behaviors::inactive(),
            SessionState::Collapse => behaviors::collapse(),
            SessionState::Fault => behaviors::fault(square_wave(
                now.duration_since(self.state_entry),
                self.config.animation.flash_hz,
            )),
            SessionState::Alive => self.alive_tick(face, telemetry, now),
            SessionState::Dead => self.dead_tick(telemetry, now),
        }
    }

    // ----------------------------------------------------------------- ALIVE

    fn alive_tick(
        &mut self,
        face: &FaceSnapshot,
        telemetry: &Telemetry,
        now: Instant,
    ) -> CommandRecord {
        let session = self.config.session.clone();

        // Greeting window outranks everything else.
        if now.duration_since(self.state_entry) < session.alive_entry_duration() {
            self.alive_behavior = AliveBehavior::Entry;
            let arm = self.arm.tick(&self.config.animation, now);
            return behaviors::alive_entry([self.tracking_base, arm, SERVO_CENTER]);
        }

        // An in-flight pour window.
        if let Some(start) = self.dispense_start {
            if now.duration_since(start) < session.dispense_flash() {
                self.alive_behavior = AliveBehavior::Dispensing;
                let valve = self.dispensing_enabled
                    && now.duration_since(start) < session.pour_duration();
                let lit = square_wave(now.duration_since(start), self.config.animation.flash_hz);
                return behaviors::alive_dispensing(
                    [self.tracking_base, SERVO_CENTER, SERVO_CENTER],
                    valve,
                    lit,
                );
            }
        }

        // An in-flight refusal window.
        if let Some(start) = self.reject_start {
            if now.duration_since(start) < session.reject_flash() {
                return self.alive_reject_cmd(start, now);
            }
        }

        if telemetry.limit_triggered {
            if self.has_dispensed {
                // One pour per session; the second press gets a head shake.
                self.reject_start = Some(now);
                self.shake.reset();
                return self.alive_reject_cmd(now, now);
            }
            if face.detected && face.num_facing > 0 {
                let hold = *self.limit_hold_start.get_or_insert(now);
                if now.duration_since(hold) >= session.dispense_hold() {
                    info!("Dispense hold complete, pouring");
                    self.has_dispensed = true;
                    self.dispense_start = Some(now);
                    self.limit_hold_start = None;
                    self.alive_behavior = AliveBehavior::Dispensing;
                    return behaviors::alive_dispensing(
                        [self.tracking_base, SERVO_CENTER, SERVO_CENTER],
                        self.dispensing_enabled,
                        true,
                    );
                }
                // Hold still maturing: keep tracking below.
            } else {
                // Cup is in place but nobody is looking at the cat.
                self.limit_hold_start = None;
            }
        } else {
            self.limit_hold_start = None;
        }

        if face.trackable(self.config.tracking.min_face_width_ratio) {
            self.alive_behavior = AliveBehavior::Detected;
            self.update_tracking(face);
            if self.arm.due(now, self.config.animation.wave_interval()) {
                self.arm.start(&self.config.animation);
            }
            let arm = self.arm.tick(&self.config.animation, now);
            return behaviors::alive_detected(
                [self.tracking_base, arm, SERVO_CENTER],
                face.num_facing > 0,
            );
        }

        self.alive_behavior = AliveBehavior::Idle;
        self.arm.cancel(now);
        self.tracking_base = drift_toward(
            self.tracking_base,
            SERVO_CENTER,
            self.config.animation.drift_speed,
        );
        behaviors::alive_idle([self.tracking_base, SERVO_CENTER, SERVO_CENTER])
    }

    fn alive_reject_cmd(&mut self, start: Instant, now: Instant) -> CommandRecord {
        self.alive_behavior = AliveBehavior::DispenseReject;
        let offset = self.shake.tick(&self.config.animation);
        let lit = square_wave(now.duration_since(start), self.config.animation.flash_hz);
        behaviors::alive_reject(
            [
                self.tracking_base + offset,
                SERVO_CENTER + offset,
                SERVO_CENTER,
            ],
            lit,
        )
    }

    /// Proportional pan controller with a deadzone and a velocity floor and
    /// ceiling, integrating into `tracking_base`.
    fn update_tracking(&mut self, face: &FaceSnapshot) {
        let Some(bbox) = face.bbox else {
            return;
        };
        if face.frame_width == 0 {
            return;
        }
        let center_x = (bbox.x as f32 + bbox.w as f32 / 2.0) / face.frame_width as f32;
        let error = center_x - 0.5;
        let tracking = &self.config.tracking;
        if error.abs() < tracking.deadzone {
            return;
        }
        let mut velocity = -error * 180.0 * tracking.gain;
        if velocity.abs() < tracking.min_velocity {
            velocity = tracking.min_velocity.copysign(velocity);
        }
        velocity = velocity.clamp(-tracking.max_velocity, tracking.max_velocity);
        self.tracking_base = (self.tracking_base + velocity).clamp(0.0, 180.0);
    }

    // ------------------------------------------------------------------ DEAD

    fn dead_tick(&mut self, telemetry: &Telemetry, now: Instant) -> CommandRecord {
        let servos = [SERVO_CENTER; NUM_SERVOS];

        if now.duration_since(self.state_entry) < self.config.session.dead_entry_duration() {
            self.dead_behavior = DeadBehavior::Entry;
            return behaviors::dead_normal(servos);
        }

        if let Some(start) = self.reject_start {
            if now.duration_since(start) < self.config.session.reject_flash() {
                return self.dead_reject_cmd(start, now);
            }
        }

        if telemetry.limit_triggered {
            self.reject_start = Some(now);
            return self.dead_reject_cmd(now, now);
        }

        self.dead_behavior = DeadBehavior::Normal;
        behaviors::dead_normal(servos)
    }

    fn dead_reject_cmd(&mut self, start: Instant, now: Instant) -> CommandRecord {
        self.dead_behavior = DeadBehavior::Reject;
        let lit = square_wave(now.duration_since(start), self.config.animation.flash_hz);
        behaviors::dead_reject([SERVO_CENTER; NUM_SERVOS], lit)
    }
}

// ---------------------------------------------------------------------------
// Thread wrapper
// ---------------------------------------------------------------------------

/// Cloneable handle exposing the operator overrides. The dashboard owns one;
/// commands land on the state machine at its next tick.
#[derive(Clone)]
pub struct OperatorHandle {
    tx: Sender<OperatorCommand>,
}

impl OperatorHandle {
    fn send(&self, command: OperatorCommand) {
        let _ = self.tx.send(command);
    }

    pub fn force_collapse(&self) {
        self.send(OperatorCommand::ForceCollapse);
    }

    pub fn force_inactive(&self) {
        self.send(OperatorCommand::ForceInactive);
    }

    pub fn skip_animation(&self) {
        self.send(OperatorCommand::SkipAnimation);
    }

    pub fn emergency_stop(&self) {
        self.send(OperatorCommand::EmergencyStop);
    }

    pub fn enable_dispensing(&self) {
        self.send(OperatorCommand::EnableDispensing);
    }

    pub fn set_forced_outcome(&self, outcome: Option<Outcome>) {
        self.send(OperatorCommand::SetForcedOutcome(outcome));
    }

    pub fn open_valve(&self) {
        self.send(OperatorCommand::OpenValve);
    }

    pub fn close_valve(&self) {
        self.send(OperatorCommand::CloseValve);
    }

    pub fn trigger_led_test(&self) {
        self.send(OperatorCommand::TriggerLedTest);
    }
}

pub fn spawn(
    state: Arc<AppState>,
    config: Arc<Config>,
    stop: Arc<AtomicBool>,
) -> (thread::JoinHandle<()>, OperatorHandle) {
    let (tx, rx) = unbounded();
    let handle = thread::spawn(move || run(state, config, stop, rx));
    (handle, OperatorHandle { tx })
}

fn run(
    state: Arc<AppState>,
    config: Arc<Config>,
    stop: Arc<AtomicBool>,
    rx: Receiver<OperatorCommand>,
) {
    info!("State machine thread starting");
    let mut machine = StateMachine::new((*config).clone());
    let tick_interval = config.session.tick_interval();
    let mut last_tick = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now.duration_since(last_tick) >= tick_interval {
            last_tick = now;
            while let Ok(command) = rx.try_recv() {
                machine.apply(command, now);
            }
            let face = state.get_face();
            let telemetry = state.get_telemetry();
            let cmd = machine.tick(&face, &telemetry, now);
            state.put_command(cmd);
        }
        thread::sleep(Duration::from_millis(1));
    }

    info!("State machine thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::protocol::LimitDirection;
    use crate::state::BBox;
    use rand::SeedableRng;

    const TICK: Duration = Duration::from_millis(33);

    /// Drives the machine with a synthetic clock and hand-built snapshots.
    struct Harness {
        machine: StateMachine,
        now: Instant,
        face: FaceSnapshot,
        telemetry: Telemetry,
        prev_valve: bool,
        dispense_edges: u32,
    }

    impl Harness {
        fn new() -> Self {
            let mut face = FaceSnapshot::default();
            face.camera_connected = true;
            face.is_dark = true;
            face.frame_width = 640;
            face.frame_height = 480;
            let mut telemetry = Telemetry::default();
            telemetry.connected = true;
            Self {
                machine: StateMachine::with_rng(Config::default(), StdRng::seed_from_u64(7)),
                now: Instant::now(),
                face,
                telemetry,
                prev_valve: false,
                dispense_edges: 0,
            }
        }

        fn tick(&mut self) -> CommandRecord {
            let cmd = self.machine.tick(&self.face, &self.telemetry, self.now);
            if cmd.valve_open && !self.prev_valve {
                self.dispense_edges += 1;
            }
            self.prev_valve = cmd.valve_open;
            self.now += TICK;
            cmd
        }

        fn tick_n(&mut self, n: u32) -> CommandRecord {
            let mut last = self.tick();
            for _ in 1..n {
                last = self.tick();
            }
            last
        }

        fn tick_for(&mut self, duration: Duration) -> CommandRecord {
            let ticks = (duration.as_millis() / TICK.as_millis()).max(1) as u32 + 1;
            self.tick_n(ticks)
        }

        fn bright(&mut self) {
            self.face.is_dark = false;
        }

        fn dark(&mut self) {
            self.face.is_dark = true;
            self.face.detected = false;
            self.face.bbox = None;
            self.face.num_faces = 0;
            self.face.num_facing = 0;
        }

        /// A trackable face at `center_x` (fraction of frame width).
        fn face_at(&mut self, center_x: f32, facing: usize) {
            self.face.is_dark = false;
            self.face.detected = true;
            let w = 100u32;
            let x = (640.0 * center_x) as i32 - (w / 2) as i32;
            self.face.bbox = Some(BBox { x, y: 100, w, h: 120 });
            self.face.num_faces = 1;
            self.face.num_facing = facing;
            self.face.is_facing = facing > 0;
        }

        fn press_cup(&mut self) {
            self.telemetry.limit_triggered = true;
            self.telemetry.limit_direction = LimitDirection::Cw;
        }

        fn release_cup(&mut self) {
            self.telemetry.limit_triggered = false;
            self.telemetry.limit_direction = LimitDirection::None;
        }

        /// INACTIVE -> COLLAPSE -> the forced outcome, past the entry window.
        fn open_session(&mut self, outcome: Outcome) {
            self.machine
                .apply(OperatorCommand::SetForcedOutcome(Some(outcome)), self.now);
            self.bright();
            self.tick_for(Duration::from_millis(1100));
            assert_eq!(self.machine.state(), SessionState::Collapse);
            self.tick_for(Duration::from_millis(2100));
            match outcome {
                Outcome::Alive => assert_eq!(self.machine.state(), SessionState::Alive),
                Outcome::Dead => assert_eq!(self.machine.state(), SessionState::Dead),
            }
            self.tick_for(Duration::from_millis(2100));
        }
    }

    #[test]
    fn starts_inactive_and_parked() {
        let mut h = Harness::new();
        let cmd = h.tick();
        assert_eq!(h.machine.state(), SessionState::Inactive);
        assert_eq!(cmd.servo_targets, [90.0; 3]);
        assert!(!cmd.valve_open);
    }

    #[test]
    fn door_open_needs_one_sustained_second_of_light() {
        let mut h = Harness::new();
        h.tick();
        h.bright();

        // First lit tick starts the run at h.now; 999 ms later is not enough.
        let run_start = h.now;
        h.tick();
        h.now = run_start + Duration::from_millis(999);
        h.tick();
        assert_eq!(h.machine.state(), SessionState::Inactive);

        h.now = run_start + Duration::from_millis(1000);
        h.tick();
        assert_eq!(h.machine.state(), SessionState::Collapse);
    }

    #[test]
    fn interrupted_light_restarts_the_clock() {
        let mut h = Harness::new();
        h.bright();
        h.tick_n(20); // 660 ms of light
        h.dark();
        h.tick(); // one dark frame resets the run
        h.bright();
        h.tick_n(20);
        assert_eq!(h.machine.state(), SessionState::Inactive);
        h.tick_n(15); // now past 1 s of continuous light
        assert_eq!(h.machine.state(), SessionState::Collapse);
    }

    #[test]
    fn collapse_times_out_into_drawn_outcome() {
        let mut h = Harness::new();
        h.machine
            .apply(OperatorCommand::SetForcedOutcome(Some(Outcome::Alive)), h.now);
        h.bright();
        h.tick_for(Duration::from_millis(1100));
        assert_eq!(h.machine.state(), SessionState::Collapse);
        assert_eq!(h.machine.outcome(), Outcome::Alive);
        let cmd = h.tick();
        // Rainbow show while collapsing.
        assert_eq!(cmd.npm_mode, crate::comm::protocol::NpmMode::Rainbow);

        let entry = h.now;
        h.now = entry + Duration::from_millis(2100);
        h.tick();
        assert_eq!(h.machine.state(), SessionState::Alive);
        assert_eq!(h.machine.alive_behavior(), AliveBehavior::Entry);
    }

    #[test]
    fn skip_short_circuits_collapse_but_keeps_outcome() {
        let mut h = Harness::new();
        h.machine
            .apply(OperatorCommand::SetForcedOutcome(Some(Outcome::Dead)), h.now);
        h.bright();
        h.tick_for(Duration::from_millis(1100));
        assert_eq!(h.machine.state(), SessionState::Collapse);
        let chosen = h.machine.outcome();

        h.machine.apply(OperatorCommand::SkipAnimation, h.now);
        h.tick();
        assert_eq!(h.machine.state(), SessionState::Dead);
        assert_eq!(h.machine.outcome(), chosen);
    }

    #[test]
    fn outcome_draw_follows_probability_extremes() {
        for (p, expected) in [(1.0, SessionState::Alive), (0.0, SessionState::Dead)] {
            let mut h = Harness::new();
            h.machine.config.session.alive_probability = p;
            h.bright();
            h.tick_for(Duration::from_millis(1100));
            h.tick_for(Duration::from_millis(2100));
            assert_eq!(h.machine.state(), expected);
        }
    }

    #[test]
    fn clean_dispense_scenario() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        h.face_at(0.5, 1);
        h.tick();
        assert_eq!(h.machine.alive_behavior(), AliveBehavior::Detected);

        // Cup pressed and someone facing: hold must mature for 1 s first.
        h.press_cup();
        let hold_start = h.now;
        h.tick();
        assert_eq!(h.machine.alive_behavior(), AliveBehavior::Detected);
        assert!(!h.prev_valve);

        h.now = hold_start + Duration::from_millis(999);
        let cmd = h.tick();
        assert!(!cmd.valve_open, "hold not mature yet");

        h.now = hold_start + Duration::from_millis(1000);
        let cmd = h.tick();
        assert!(cmd.valve_open, "hold matured, pour starts");
        assert_eq!(h.machine.alive_behavior(), AliveBehavior::Dispensing);
        assert!(h.machine.has_dispensed());
        let pour_start = h.now - TICK;

        // Valve stays up for the pour, then drops while the flash continues.
        h.now = pour_start + Duration::from_millis(2900);
        let cmd = h.tick();
        assert!(cmd.valve_open);
        h.now = pour_start + Duration::from_millis(3100);
        let cmd = h.tick();
        assert!(!cmd.valve_open);
        assert_eq!(h.machine.alive_behavior(), AliveBehavior::Dispensing);

        // Flash window over; cup released meanwhile.
        h.release_cup();
        h.now = pour_start + Duration::from_millis(5100);
        h.tick();
        assert_ne!(h.machine.alive_behavior(), AliveBehavior::Dispensing);
        assert_eq!(h.dispense_edges, 1);
    }

    #[test]
    fn second_attempt_in_same_session_is_rejected() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        h.face_at(0.5, 1);
        h.press_cup();
        h.tick_for(Duration::from_millis(1100)); // hold + pour start
        assert!(h.machine.has_dispensed());
        h.release_cup();
        h.tick_for(Duration::from_millis(5200)); // pour + flash fully over

        // Second press: immediate refusal, no hold, valve stays shut.
        h.press_cup();
        let mut max_offset: f32 = 0.0;
        let mut min_offset: f32 = 0.0;
        for _ in 0..60 {
            let cmd = h.tick();
            assert!(!cmd.valve_open);
            assert_eq!(h.machine.alive_behavior(), AliveBehavior::DispenseReject);
            let offset = cmd.servo_targets[0] - 90.0;
            max_offset = max_offset.max(offset);
            min_offset = min_offset.min(offset);
        }
        assert!(max_offset >= 29.0 && max_offset <= 30.0, "{max_offset}");
        assert!(min_offset <= -29.0 && min_offset >= -30.0, "{min_offset}");
        assert_eq!(h.dispense_edges, 1);
    }

    #[test]
    fn dead_never_dispenses() {
        let mut h = Harness::new();
        h.open_session(Outcome::Dead);
        assert_eq!(h.machine.state(), SessionState::Dead);
        h.face_at(0.5, 1);
        h.press_cup();
        for _ in 0..120 {
            let cmd = h.tick();
            assert!(!cmd.valve_open);
            assert_eq!(h.machine.state(), SessionState::Dead);
        }
        assert_eq!(h.machine.dead_behavior(), DeadBehavior::Reject);
        assert_eq!(h.dispense_edges, 0);
    }

    #[test]
    fn emergency_stop_kills_an_active_pour() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        h.face_at(0.5, 1);
        h.press_cup();
        let cmd = h.tick_for(Duration::from_millis(1100));
        assert!(cmd.valve_open);

        h.machine.apply(OperatorCommand::EmergencyStop, h.now);
        for _ in 0..200 {
            let cmd = h.tick();
            assert!(!cmd.valve_open);
            assert!(cmd.emergency_stop);
        }

        h.machine.apply(OperatorCommand::EnableDispensing, h.now);
        let cmd = h.tick();
        assert!(!cmd.emergency_stop);
    }

    #[test]
    fn door_closing_ends_the_session_at_two_seconds() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        h.face_at(0.5, 1);
        h.press_cup();
        h.tick_for(Duration::from_millis(1100));
        assert!(h.machine.has_dispensed());
        h.release_cup();

        h.dark();
        let dark_start = h.now;
        h.tick();
        h.now = dark_start + Duration::from_millis(1999);
        h.tick();
        assert_eq!(h.machine.state(), SessionState::Alive);

        h.now = dark_start + Duration::from_millis(2000);
        h.tick();
        assert_eq!(h.machine.state(), SessionState::Inactive);
        assert!(!h.machine.has_dispensed());
    }

    #[test]
    fn one_pour_per_session_across_many_presses() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        h.face_at(0.5, 1);
        // Press, release, press again, over and over.
        for round in 0..6 {
            h.press_cup();
            h.tick_for(Duration::from_millis(1500));
            h.release_cup();
            h.tick_for(Duration::from_millis(500));
            assert!(h.machine.has_dispensed(), "round {round}");
        }
        assert_eq!(h.dispense_edges, 1);

        // New session: the latch resets and one more pour is allowed.
        h.dark();
        h.tick_for(Duration::from_millis(2100));
        assert_eq!(h.machine.state(), SessionState::Inactive);
        h.open_session(Outcome::Alive);
        h.face_at(0.5, 1);
        h.press_cup();
        h.tick_for(Duration::from_millis(1200));
        assert_eq!(h.dispense_edges, 2);
    }

    #[test]
    fn disabled_dispensing_never_opens_the_valve() {
        let mut h = Harness::new();
        h.machine.apply(OperatorCommand::EmergencyStop, h.now);
        h.machine.apply(OperatorCommand::OpenValve, h.now);
        h.open_session(Outcome::Alive);
        h.face_at(0.5, 1);
        h.press_cup();
        for _ in 0..300 {
            let cmd = h.tick();
            assert!(!cmd.valve_open);
        }
        assert_eq!(h.dispense_edges, 0);
    }

    #[test]
    fn manual_valve_runs_one_pour_length() {
        let mut h = Harness::new();
        h.tick();
        h.machine.apply(OperatorCommand::OpenValve, h.now);
        let opened = h.now;
        let cmd = h.tick();
        assert!(cmd.valve_open);

        h.now = opened + Duration::from_millis(2900);
        assert!(h.tick().valve_open);
        h.now = opened + Duration::from_millis(3000);
        h.tick(); // expiry observed on this tick
        assert!(!h.tick().valve_open);
    }

    #[test]
    fn manual_close_is_immediate() {
        let mut h = Harness::new();
        h.tick();
        h.machine.apply(OperatorCommand::OpenValve, h.now);
        assert!(h.tick().valve_open);
        h.machine.apply(OperatorCommand::CloseValve, h.now);
        assert!(!h.tick().valve_open);
    }

    #[test]
    fn mcu_loss_faults_from_any_state_and_recovers() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);

        h.telemetry.connected = false;
        let cmd = h.tick();
        assert_eq!(h.machine.state(), SessionState::Fault);
        assert_eq!(cmd.servo_targets, [90.0; 3]);
        assert!(!cmd.valve_open);
        assert_eq!(cmd.matrix_left, crate::comm::protocol::MatrixPattern::X);

        h.telemetry.connected = true;
        h.tick();
        assert_eq!(h.machine.state(), SessionState::Inactive);
    }

    #[test]
    fn fault_holds_while_dispensing_disabled() {
        let mut h = Harness::new();
        h.machine.apply(OperatorCommand::EmergencyStop, h.now);
        h.telemetry.connected = false;
        h.tick();
        assert_eq!(h.machine.state(), SessionState::Fault);

        h.telemetry.connected = true;
        h.tick_n(5);
        assert_eq!(h.machine.state(), SessionState::Fault);

        h.machine.apply(OperatorCommand::EnableDispensing, h.now);
        h.tick();
        assert_eq!(h.machine.state(), SessionState::Inactive);
    }

    #[test]
    fn camera_loss_ends_any_session() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        h.face.camera_connected = false;
        h.tick();
        assert_eq!(h.machine.state(), SessionState::Inactive);
    }

    #[test]
    fn tracking_holds_still_inside_deadzone() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        h.face_at(0.54, 1); // error 0.04, inside the 0.05 deadzone
        let before = h.machine.tracking_base();
        h.tick_n(30);
        assert_eq!(h.machine.tracking_base(), before);
    }

    #[test]
    fn tracking_velocity_is_clamped_and_signed() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        // Face far to the right: base must walk left at most 3 deg/tick.
        h.face_at(0.9, 1);
        let mut prev = h.machine.tracking_base();
        for _ in 0..20 {
            h.tick();
            let base = h.machine.tracking_base();
            let delta = base - prev;
            assert!(delta < 0.0, "pan moves away from a right-side face");
            assert!(delta.abs() <= 3.0 + f32::EPSILON);
            prev = base;
        }
    }

    #[test]
    fn tracking_base_clamps_at_travel_limits() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        h.face_at(0.95, 1);
        h.tick_n(2000);
        assert!(h.machine.tracking_base() >= 0.0);
        let cmd = h.tick();
        assert!(cmd.servo_targets[0] >= 0.0);
    }

    #[test]
    fn hold_requires_a_facing_visitor() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        h.face_at(0.5, 0); // present but looking away
        h.press_cup();
        for _ in 0..120 {
            let cmd = h.tick();
            assert!(!cmd.valve_open);
        }
        assert!(!h.machine.has_dispensed());

        // Facing lost halfway through a hold resets the timer.
        h.face_at(0.5, 1);
        h.tick_n(15); // ~0.5 s of hold
        h.face.num_facing = 0;
        h.tick();
        h.face.num_facing = 1;
        h.tick_n(16); // would have matured had the hold survived
        assert!(!h.machine.has_dispensed());
        h.tick_n(20);
        assert!(h.machine.has_dispensed());
    }

    #[test]
    fn idle_drifts_back_to_center() {
        let mut h = Harness::new();
        h.open_session(Outcome::Alive);
        h.face_at(0.9, 1);
        h.tick_n(10);
        let displaced = h.machine.tracking_base();
        assert!(displaced < 90.0);

        // Visitor walks away (still lit, nothing trackable).
        h.face.detected = false;
        h.face.bbox = None;
        h.face.num_faces = 0;
        h.face.num_facing = 0;
        let mut prev = displaced;
        for _ in 0..60 {
            h.tick();
            let base = h.machine.tracking_base();
            assert!(base - prev <= 2.0 + f32::EPSILON);
            prev = base;
        }
        assert_eq!(h.machine.alive_behavior(), AliveBehavior::Idle);
        assert!((h.machine.tracking_base() - 90.0).abs() < 0.01);
    }

    #[test]
    fn led_test_flag_latches_until_confirmed() {
        let mut h = Harness::new();
        h.machine.apply(OperatorCommand::TriggerLedTest, h.now);
        let cmd = h.tick();
        assert_eq!(cmd.flags & CMD_FLAG_LED_TEST, CMD_FLAG_LED_TEST);

        // MCU confirms: flag drops.
        h.telemetry.test_active = true;
        h.tick();
        h.telemetry.test_active = false;
        let cmd = h.tick();
        assert_eq!(cmd.flags & CMD_FLAG_LED_TEST, 0);
    }

    #[test]
    fn operator_handle_delivers_to_thread() {
        let state = Arc::new(AppState::new());
        let config = Arc::new(Config::default());
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, operator) = spawn(state.clone(), config, stop.clone());

        operator.emergency_stop();
        // Give the tick loop a moment to pick it up and publish.
        thread::sleep(Duration::from_millis(200));
        assert!(state.get_command().emergency_stop);

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
