//! The rename engine: atomic rekey plus folder-subtree rewrite.
//!
//! A rename never creates a new state; the Rename task rekeys the existing
//! record on its owner node (remove old key, store under the new one), and
//! every node then rewrites its own side tables. For folder renames each
//! node additionally sweeps the portion of the main map it owns, rekeying
//! every state under the old prefix; the sweeps across all members cover
//! the whole key space.

use tracing::debug;

use crate::cache::CacheInner;
use crate::cluster::task::{StateTask, TaskOptions, TaskReply};
use crate::cluster::topic::{MessageTarget, StateMessage};
use crate::config::DebugFlags;
use crate::error::StateResult;
use crate::path;
use crate::state::{now_millis, FileState, FileStatus};

impl CacheInner {
    /// Renames a state: rekey task on the old key's owner, local side
    /// tables rewritten, then the rename announced to the cluster.
    pub(crate) async fn rename_state(
        &self,
        old_path: &str,
        new_path: &str,
        is_folder: bool,
    ) -> StateResult<()> {
        self.ensure_running()?;
        let old_norm = self.normalize(old_path);
        let new_norm = self.normalize(new_path);

        let reply = self
            .dispatcher
            .dispatch(
                &old_norm,
                StateTask::Rename { new_path: new_norm.clone(), is_folder },
                TaskOptions::LOCK_STATE | TaskOptions::NO_UPDATE,
            )
            .await?;
        let TaskReply::Flag(moved) = reply else {
            return Err(Self::unexpected_reply("Rename"));
        };
        if !moved {
            // Nothing was cached under the old path; seed the new one so
            // lookups resolve after the rename.
            let status =
                if is_folder { FileStatus::DirectoryExists } else { FileStatus::FileExists };
            let mut fresh = FileState::new(&new_norm, status);
            fresh.bump_expiry(now_millis(), self.config.state_expiry.as_millis() as i64);
            self.map.put_if_absent(&new_norm, fresh);
        }

        self.rewrite_local_tables(&old_norm, &new_norm, is_folder);
        if let Some(listener) = self.state_listener() {
            listener.file_state_renamed(&old_norm, &new_norm);
        }
        if self.config.has_debug(DebugFlags::RENAME) {
            debug!(old = %old_norm, new = %new_norm, is_folder, "state renamed");
        }
        self.publisher.publish(
            MessageTarget::AllNodes,
            StateMessage::RenameState { old_path: old_norm, new_path: new_norm, is_folder },
        );
        Ok(())
    }

    /// Applies a RenameState message: siblings rewrite their side tables
    /// and fire the rename notification; every node, the publisher
    /// included, sweeps its owned share of the main map for folder
    /// renames.
    pub(crate) async fn handle_rename_message(
        &self,
        own_message: bool,
        old_path: &str,
        new_path: &str,
        is_folder: bool,
    ) {
        if !own_message {
            self.rewrite_local_tables(old_path, new_path, is_folder);
            self.hosts.notify_handler.notify_rename(old_path, new_path);
        }
        if is_folder {
            self.rename_owned_subtree(old_path, new_path).await;
        }
    }

    /// Rewrites the near-cache and per-node tables for a rename.
    fn rewrite_local_tables(&self, old_path: &str, new_path: &str, is_folder: bool) {
        self.per_node.rename(old_path, new_path);
        if let Some(near) = &self.near {
            near.rename(old_path, new_path, is_folder);
        }
        if is_folder {
            self.per_node.rename_folder(old_path, new_path);
            if let Some(near) = &self.near {
                near.rename_folder(old_path, new_path);
            }
        }
    }

    /// Rekeys every state under `old_prefix` stored in partitions this
    /// node owns.
    async fn rename_owned_subtree(&self, old_prefix: &str, new_prefix: &str) {
        let owned = self.fabric.owned_partitions(&self.node);
        let mut moved = 0usize;
        for key in self.map.keys_in_partitions(&owned) {
            if !path::is_under_folder(&key, old_prefix) {
                continue;
            }
            let Some(new_key) = path::rebase(&key, old_prefix, new_prefix) else {
                continue;
            };
            let lock_id = self.fabric.next_task_id();
            self.map.lock(&key, lock_id, &self.node).await;
            if let Some(mut state) = self.map.remove(&key) {
                state.apply_rekey(&new_key);
                state.set_valid(true);
                self.map.put(&new_key, state);
                moved += 1;
            }
            self.map.unlock(&key, lock_id);
        }
        if moved > 0 && self.config.has_debug(DebugFlags::RENAME) {
            debug!(old = old_prefix, new = new_prefix, moved, "folder subtree rekeyed");
        }
    }
}
