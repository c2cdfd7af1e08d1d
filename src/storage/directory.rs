use crate::model::Person;

/// Per-session lookups about the board currently in focus: the id of the
/// group that owns it and its member/owner lists.
///
/// Everything is dropped when the focus moves to another board.
#[derive(Debug, Default)]
pub struct BoardDirectory {
    board_id: Option<String>,
    group_id: Option<String>,
    members: Option<Vec<Person>>,
    owners: Option<Vec<Person>>,
}

impl BoardDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the directory at `board_id`, invalidating it if that is a
    /// different board than before.
    pub fn focus(&mut self, board_id: &str) {
        if self.board_id.as_deref() != Some(board_id) {
            if let Some(old) = &self.board_id {
                log::debug!("Board directory switching from {old} to {board_id}");
            }
            *self = Self {
                board_id: Some(board_id.to_string()),
                ..Self::default()
            };
        }
    }

    pub fn invalidate(&mut self) {
        *self = Self::default();
    }

    pub fn board_id(&self) -> Option<&str> {
        self.board_id.as_deref()
    }

    pub fn group_id(&self, board_id: &str) -> Option<&str> {
        self.for_board(board_id)?.group_id.as_deref()
    }

    pub fn set_group_id(&mut self, board_id: &str, group_id: impl Into<String>) {
        self.focus(board_id);
        self.group_id = Some(group_id.into());
    }

    pub fn members(&self, board_id: &str) -> Option<&[Person]> {
        self.for_board(board_id)?.members.as_deref()
    }

    pub fn set_members(&mut self, board_id: &str, members: Vec<Person>) {
        self.focus(board_id);
        self.members = Some(members);
    }

    pub fn owners(&self, board_id: &str) -> Option<&[Person]> {
        self.for_board(board_id)?.owners.as_deref()
    }

    pub fn set_owners(&mut self, board_id: &str, owners: Vec<Person>) {
        self.focus(board_id);
        self.owners = Some(owners);
    }

    fn for_board(&self, board_id: &str) -> Option<&Self> {
        (self.board_id.as_deref() == Some(board_id)).then_some(self)
    }
}
