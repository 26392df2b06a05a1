//! Canonical store locations for every record the core touches.

use shared::domain::{ConversationKey, GroupId, RequestId, UserId};
use store::StorePath;
use translation::ChatScope;

pub fn connect_messages(key: &ConversationKey) -> StorePath {
    StorePath::new(["connect_chats", key.as_str()])
}

pub fn direct_messages(key: &ConversationKey) -> StorePath {
    StorePath::new(["messages", key.as_str()])
}

pub fn pairwise_messages(scope: ChatScope, key: &ConversationKey) -> StorePath {
    match scope {
        ChatScope::Direct => direct_messages(key),
        ChatScope::Connect => connect_messages(key),
    }
}

pub fn connection_requests() -> StorePath {
    StorePath::new(["connection_requests"])
}

pub fn connection_request(request_id: &RequestId) -> StorePath {
    connection_requests().child(request_id.as_str())
}

pub fn group(group_id: &GroupId) -> StorePath {
    StorePath::new(["groups", group_id.as_str()])
}

pub fn group_members(group_id: &GroupId) -> StorePath {
    group(group_id).child("members")
}

pub fn group_member(group_id: &GroupId, user_id: &UserId) -> StorePath {
    group_members(group_id).child(user_id.as_str())
}

pub fn group_messages(group_id: &GroupId) -> StorePath {
    StorePath::new(["group_messages", group_id.as_str()])
}

pub fn user_profile(user_id: &UserId) -> StorePath {
    StorePath::new(["users", user_id.as_str()])
}
