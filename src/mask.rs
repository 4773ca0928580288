//! Event mask bits
//!
//! The bit layout mirrors inotify exactly so a mask can be handed to the
//! kernel (or any compatible facility) without translation.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventMask: u32 {
        /// Data was read from a file
        const ACCESS = 0x0000_0001;
        /// Data was written to a file
        const MODIFY = 0x0000_0002;
        /// Metadata (permissions, owner, timestamps) changed
        const ATTRIB = 0x0000_0004;
        /// A file opened for writing was closed
        const CLOSE_WRITE = 0x0000_0008;
        /// A file opened read-only was closed
        const CLOSE_NOWRITE = 0x0000_0010;
        /// A file or directory was opened
        const OPEN = 0x0000_0020;
        /// An entry was moved out of the watched directory
        const MOVED_FROM = 0x0000_0040;
        /// An entry was moved into the watched directory
        const MOVED_TO = 0x0000_0080;
        /// An entry was created in the watched directory
        const CREATE = 0x0000_0100;
        /// An entry was deleted from the watched directory
        const DELETE = 0x0000_0200;
        /// The watched directory itself was deleted
        const DELETE_SELF = 0x0000_0400;
        /// The watched directory itself was moved
        const MOVE_SELF = 0x0000_0800;
        /// The filesystem holding the watched directory was unmounted
        const UNMOUNT = 0x0000_2000;
        /// The event queue overflowed and events were dropped
        const Q_OVERFLOW = 0x0000_4000;
        /// The watch was removed, explicitly or by the kernel
        const IGNORED = 0x0000_8000;
        /// Only watch the path if it is a directory
        const ONLYDIR = 0x0100_0000;
        /// Do not follow a symbolic link at the watched path
        const DONT_FOLLOW = 0x0200_0000;
        /// Add to the mask of an existing watch instead of replacing it
        const MASK_ADD = 0x2000_0000;
        /// The subject of the event is a directory
        const ISDIR = 0x4000_0000;
        /// Remove the watch after one event
        const ONESHOT = 0x8000_0000;

        const CLOSE = Self::CLOSE_WRITE.bits() | Self::CLOSE_NOWRITE.bits();
        const MOVE = Self::MOVED_FROM.bits() | Self::MOVED_TO.bits();

        /// Every event kind a watch can request
        const ALL_EVENTS = Self::ACCESS.bits()
            | Self::MODIFY.bits()
            | Self::ATTRIB.bits()
            | Self::CLOSE_WRITE.bits()
            | Self::CLOSE_NOWRITE.bits()
            | Self::OPEN.bits()
            | Self::MOVED_FROM.bits()
            | Self::MOVED_TO.bits()
            | Self::CREATE.bits()
            | Self::DELETE.bits()
            | Self::DELETE_SELF.bits()
            | Self::MOVE_SELF.bits();

        /// Changes to directory contents, without reads or attribute noise
        const FILE_CHANGED = Self::CREATE.bits()
            | Self::DELETE.bits()
            | Self::MOVED_FROM.bits()
            | Self::MOVED_TO.bits()
            | Self::CLOSE_WRITE.bits();
    }
}

impl EventMask {
    const CONTROL: EventMask = EventMask::ONLYDIR
        .union(EventMask::DONT_FOLLOW)
        .union(EventMask::MASK_ADD)
        .union(EventMask::ISDIR)
        .union(EventMask::ONESHOT);

    /// The event-kind bits only, with ISDIR and the watch-control flags removed.
    pub fn kind_bits(self) -> EventMask {
        self.difference(Self::CONTROL)
    }

    /// Mask handed to the low-level facility for one directory of a watch.
    ///
    /// The registry needs self events to notice a vanished directory and,
    /// for recursive watches, create/move events to extend coverage. These are
    /// added on top of what the caller asked for; dispatch still filters on
    /// the caller's mask.
    pub fn install_mask(self, recursive: bool) -> EventMask {
        let mut mask = self.kind_bits() | EventMask::DELETE_SELF | EventMask::MOVE_SELF;
        if recursive {
            mask |= EventMask::CREATE | EventMask::MOVE;
        }
        mask
    }

    pub fn is_dir(self) -> bool {
        self.contains(EventMask::ISDIR)
    }

    /// Parse a lowercase event name as accepted on the command line and in config files.
    pub fn parse_name(name: &str) -> Option<EventMask> {
        let mask = match name.trim().to_ascii_lowercase().as_str() {
            "access" => EventMask::ACCESS,
            "modify" => EventMask::MODIFY,
            "attrib" => EventMask::ATTRIB,
            "close_write" => EventMask::CLOSE_WRITE,
            "close_nowrite" => EventMask::CLOSE_NOWRITE,
            "close" => EventMask::CLOSE,
            "open" => EventMask::OPEN,
            "moved_from" => EventMask::MOVED_FROM,
            "moved_to" => EventMask::MOVED_TO,
            "move" => EventMask::MOVE,
            "create" => EventMask::CREATE,
            "delete" => EventMask::DELETE,
            "delete_self" => EventMask::DELETE_SELF,
            "move_self" => EventMask::MOVE_SELF,
            "file_changed" => EventMask::FILE_CHANGED,
            "all" => EventMask::ALL_EVENTS,
            _ => return None,
        };
        Some(mask)
    }

    /// Fold a list of event names into one mask, failing on the first unknown name.
    pub fn from_names<I, S>(names: I) -> Result<EventMask, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().try_fold(EventMask::empty(), |acc, name| {
            let name = name.as_ref();
            EventMask::parse_name(name)
                .map(|mask| acc | mask)
                .ok_or_else(|| format!("unknown event name: {}", name))
        })
    }
}
