pub mod frame_queue;
pub mod session;
pub mod wrappers;

/// The [`StateMachine`] trait gives the protocol's bookkeeping a uniform calling convention and
/// marks the types that are guaranteed to behave deterministically.
///
/// # Functionality
/// A machine consumes [`Input`](StateMachine::Input) through
/// [`process_input`](StateMachine::process_input) and hands back the work it wants done through
/// [`poll_output`](StateMachine::poll_output). Inputs and outputs are usually enums, one variant
/// per event or action. The machine decides; its owner performs.
///
/// For the session this means the machine decides that a handshake or a `pong` must be sent, and
/// the connection that owns it does the actual sending.
///
/// # Invariants
/// Implementors *must* be pure:
///
/// - No interior mutability and no shared ownership (`Cell`, `Mutex`, `Arc`, ...). Mutation only
///   happens through `&mut self`. The owner provides synchronisation by wrapping the whole
///   machine.
/// - No IO of any kind, including the system clock and system entropy. Time is supplied as input,
///   see [`wrappers`].
/// - No threads, no async, no blocking.
///
/// Logging is the one tolerated side effect, as long as nothing depends on its outcome.
///
/// # Handling Time via Injection
/// Liveness needs "now". Rather than reading the clock, the owner generates an
/// [`Instant`](std::time::Instant) through [`SystemResource`](wrappers::system::SystemResource)
/// and feeds it in as [`SystemInput::System`](wrappers::system::SystemInput::System) before the
/// protocol input it accompanies. Tests feed synthetic instants instead and never sleep.
///
/// # Example
/// ```ignore
/// let mut queue = FrameQueueMachine::new();
/// queue.process_input(FrameInput::Arrived(r#"{"msg":"ready","subs":["1"]}"#.to_string()));
///
/// while let Some(FrameOutput::Deliver(raw)) = queue.poll_output() {
///     dispatcher.dispatch_raw(&raw);
/// }
/// ```
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) from the state machine.
    type Output;

    /// Process the provided `input` into the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the first available output if present.
    fn poll_output(&mut self) -> Option<Self::Output>;
}
