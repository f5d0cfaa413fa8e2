use impl_trait_for_tuples::impl_for_tuples;

/// A resource produced from the ambient system context (the clock, for instance).
///
/// Owners of a [`StateMachine`](super::super::StateMachine) call
/// [`generate`](SystemResource::generate) and pass the result in through [`SystemInput`], so the
/// machine itself never touches the system.
pub trait SystemResource {
    /// Produce an instance of this resource from the implicit system context.
    fn generate() -> Self;
}

#[impl_for_tuples(1, 4)]
impl SystemResource for Tuple {
    fn generate() -> Self {
        for_tuples!( ( #( Tuple::generate() ),* ) )
    }
}

impl SystemResource for std::time::Instant {
    fn generate() -> Self {
        std::time::Instant::now()
    }
}

/// Input wrapper carrying either a protocol input `I` or a system resource `S`.
#[derive(Debug, Clone)]
pub enum SystemInput<I, S> {
    Input(I),
    System(S),
}

impl<I, S: SystemResource> SystemInput<I, S> {
    /// A freshly generated system resource.
    pub fn now() -> Self {
        Self::System(S::generate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_instant_generation_is_monotonic() {
        let first = Instant::generate();
        let (second,) = <(Instant,)>::generate();
        assert!(second >= first);
    }

    #[test]
    fn test_now_wraps_system_variant() {
        let input: SystemInput<(), Instant> = SystemInput::now();
        assert!(matches!(input, SystemInput::System(_)));
    }
}
