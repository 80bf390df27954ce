use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Submission,
    Mx,
}

#[derive(Debug, Default, Clone)]
pub struct Envelope {
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
}

impl Envelope {
    pub fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }
}

#[derive(Debug, Default)]
pub struct AuthState {
    pub user_id: Option<Uuid>,
    pub consecutive_failures: u32,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}
