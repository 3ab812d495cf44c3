use loomerp_core::UserId;

/// Who is acting on a request.
///
/// Authentication happens upstream; the gateway forwards the user id in the
/// `x-actor-id` header. Requests without one are attributed to nobody.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ActorContext {
    actor_id: Option<UserId>,
}

impl ActorContext {
    pub fn new(actor_id: Option<UserId>) -> Self {
        Self { actor_id }
    }

    pub fn actor_id(&self) -> Option<UserId> {
        self.actor_id
    }
}
