/// Message tags reserved by the farming protocol.
///
/// The discriminants are the wire values. Applications that talk to the
/// transport directly must choose tags outside this set, see [`Tag::reserves`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Tag {
    /// worker -> controller, payload is the worker's own rank
    RequestWork = 1111,
    /// controller -> worker, 1 = work follows, 0 = terminate
    DataAvailable = 2222,
    /// length prefix paired with any framed payload
    MessageLength = 3333,
    /// framed work item
    MessageData = 4444,
    /// framed result
    MessageResult = 5555,
    /// framed error, zero-length when the job succeeded
    MessageError = 6666,
}

impl Tag {
    /// whether `tag` collides with a tag reserved by the farming protocol
    pub fn reserves(tag: i32) -> bool {
        matches!(tag, 1111 | 2222 | 3333 | 4444 | 5555 | 6666)
    }
}

impl From<Tag> for i32 {
    fn from(tag: Tag) -> i32 {
        tag as i32
    }
}
