//! Transaction status tracking.
//!
//! The status only moves when the server reports a command tag, an error, or when the
//! connection dies. What the caller intends to do is never taken into account.
use crate::{
    common::verbose,
    ext::StrExt,
    postgres::ServerVersion,
};

/// Transaction status of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Autocommit, no transaction is open.
    #[default]
    Idle,
    InTransaction,
    /// A statement failed inside the transaction, only `ROLLBACK` is meaningful.
    InErroredTransaction,
}

impl TransactionStatus {
    pub fn in_transaction(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Command tag from `CommandComplete`, classified by its leading keyword.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandTag {
    Begin,
    /// `COMMIT` or `END`
    Commit,
    Rollback,
    Abort,
    /// Any other command, with the trailing row count if any.
    Other {
        rows: Option<u64>,
    },
}

impl CommandTag {
    pub fn parse(tag: &str) -> CommandTag {
        if tag.starts_with_ignore_case("BEGIN") {
            Self::Begin
        } else if tag.starts_with_ignore_case("COMMIT") || tag.starts_with_ignore_case("END") {
            Self::Commit
        } else if tag.starts_with_ignore_case("ROLLBACK") {
            Self::Rollback
        } else if tag.starts_with_ignore_case("ABORT") {
            Self::Abort
        } else {
            let rows = tag
                .trim_end()
                .rsplit_once(' ')
                .and_then(|(_, count)| count.parse().ok());
            Self::Other { rows }
        }
    }
}

/// What the caller should do after a command tag is observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct TagEffect {
    /// Marked plans should be discarded.
    pub flush: bool,
}

/// Transaction status together with the server resources bound to it.
#[derive(Debug, Default)]
pub struct TransactionTracker {
    status: TransactionStatus,
    cursors: Vec<String>,
    plans: Vec<String>,
}

impl TransactionTracker {
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Update the status from a command tag of `query`.
    pub fn observe(&mut self, tag: CommandTag, query: &str, version: ServerVersion) -> TagEffect {
        let effect = match tag {
            CommandTag::Begin => {
                self.status = TransactionStatus::InTransaction;
                TagEffect::default()
            }
            CommandTag::Commit => {
                self.status = TransactionStatus::Idle;
                self.cursors.clear();
                TagEffect { flush: true }
            }
            CommandTag::Rollback => {
                if !version.has_savepoints() || !query.contains_token("TO") {
                    let was_open = self.status.in_transaction();
                    self.status = TransactionStatus::Idle;
                    self.cursors.clear();
                    TagEffect { flush: was_open }
                } else {
                    TagEffect::default()
                }
            }
            CommandTag::Abort => {
                self.status = TransactionStatus::Idle;
                self.cursors.clear();
                TagEffect::default()
            }
            CommandTag::Other { .. } => TagEffect::default(),
        };
        verbose!(?tag, status = ?self.status, "transaction");
        effect
    }

    /// A statement failed without terminating the connection.
    pub fn observe_error(&mut self) {
        if self.status.in_transaction() {
            self.status = TransactionStatus::InErroredTransaction;
        }
        self.cursors.clear();
        verbose!(status = ?self.status, "transaction error");
    }

    /// State cannot survive a dead transport, marked plans are kept.
    pub fn connection_dead(&mut self) {
        self.status = TransactionStatus::Idle;
        self.cursors.clear();
    }

    /// Forget everything, used when the connection is closed.
    pub fn reset(&mut self) {
        self.status = TransactionStatus::Idle;
        self.cursors.clear();
        self.plans.clear();
    }

    pub fn open_cursor(&mut self, name: &str) {
        if !self.cursors.iter().any(|e| e == name) {
            self.cursors.push(name.to_owned());
        }
    }

    pub fn close_cursor(&mut self, name: &str) {
        self.cursors.retain(|e| e != name);
    }

    pub fn cursors(&self) -> &[String] {
        &self.cursors
    }

    pub fn mark_plan(&mut self, name: &str) {
        self.plans.push(name.to_owned());
    }

    /// Plans are discarded from the most recently marked.
    pub fn next_plan(&self) -> Option<&str> {
        self.plans.last().map(String::as_str)
    }

    /// Remove the most recent mark of `name`.
    pub fn plan_discarded(&mut self, name: &str) {
        if let Some(idx) = self.plans.iter().rposition(|e| e == name) {
            self.plans.remove(idx);
        }
    }

    pub fn plans(&self) -> &[String] {
        &self.plans
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const V74: ServerVersion = ServerVersion::new(7, 4);
    const V80: ServerVersion = ServerVersion::new(8, 0);

    #[test]
    fn parse_tag() {
        assert_eq!(CommandTag::parse("BEGIN"), CommandTag::Begin);
        assert_eq!(CommandTag::parse("end"), CommandTag::Commit);
        assert_eq!(CommandTag::parse("INSERT 0 3"), CommandTag::Other { rows: Some(3) });
        assert_eq!(CommandTag::parse("UPDATE 12 "), CommandTag::Other { rows: Some(12) });
        assert_eq!(CommandTag::parse("CREATE"), CommandTag::Other { rows: None });
    }

    #[test]
    fn commit_clears_cursors() {
        let mut tx = TransactionTracker::default();
        let _ = tx.observe(CommandTag::Begin, "BEGIN", V74);
        tx.open_cursor("c1");
        assert_eq!(tx.status(), TransactionStatus::InTransaction);

        let effect = tx.observe(CommandTag::Commit, "COMMIT", V74);
        assert!(effect.flush);
        assert_eq!(tx.status(), TransactionStatus::Idle);
        assert!(tx.cursors().is_empty());
    }

    #[test]
    fn errored_transaction() {
        let mut tx = TransactionTracker::default();
        tx.observe_error();
        assert_eq!(tx.status(), TransactionStatus::Idle);

        let _ = tx.observe(CommandTag::Begin, "BEGIN", V74);
        tx.observe_error();
        tx.observe_error();
        assert_eq!(tx.status(), TransactionStatus::InErroredTransaction);

        let effect = tx.observe(CommandTag::Rollback, "ROLLBACK", V74);
        assert!(effect.flush);
        assert_eq!(tx.status(), TransactionStatus::Idle);
    }

    #[test]
    fn savepoint_rollback() {
        let mut tx = TransactionTracker::default();
        let _ = tx.observe(CommandTag::Begin, "BEGIN", V80);
        tx.open_cursor("c1");

        let effect = tx.observe(CommandTag::Rollback, "ROLLBACK TO SAVEPOINT a", V80);
        assert!(!effect.flush);
        assert_eq!(tx.status(), TransactionStatus::InTransaction);
        assert_eq!(tx.cursors().len(), 1);

        // savepoints did not exist, any rollback is a full one
        let _ = tx.observe(CommandTag::Rollback, "ROLLBACK TO SAVEPOINT a", V74);
        assert_eq!(tx.status(), TransactionStatus::Idle);
        assert!(tx.cursors().is_empty());
    }

    #[test]
    fn abort_keeps_plans() {
        let mut tx = TransactionTracker::default();
        tx.mark_plan("p1");
        tx.mark_plan("p2");
        let _ = tx.observe(CommandTag::Begin, "BEGIN", V74);

        let effect = tx.observe(CommandTag::Abort, "ABORT", V74);
        assert!(!effect.flush);
        assert_eq!(tx.status(), TransactionStatus::Idle);
        assert_eq!(tx.next_plan(), Some("p2"));

        tx.mark_plan("p3");
        tx.plan_discarded("p2");
        assert_eq!(tx.plans(), ["p1", "p3"]);
    }

    #[test]
    fn connection_dead() {
        let mut tx = TransactionTracker::default();
        let _ = tx.observe(CommandTag::Begin, "BEGIN", V74);
        tx.observe_error();
        tx.connection_dead();
        assert_eq!(tx.status(), TransactionStatus::Idle);
    }
}
