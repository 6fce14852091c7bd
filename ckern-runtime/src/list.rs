//! Index-linked doubly-linked lists.
//!
//! Nodes live in an arena owned by the caller; a list only stores the
//! indices of its first and last node. Every node embeds one [`Link`] per
//! list it can be a member of, and the list is told how to reach that link
//! through a plain function. Splicing is O(1) and never allocates.

/// Membership of one node in one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Link<I> {
    prev: Option<I>,
    next: Option<I>,
    linked: bool,
}

impl<I> Link<I> {
    /// A link of a node which is not in the list.
    pub(crate) const fn new() -> Self {
        Self {
            prev: None,
            next: None,
            linked: false,
        }
    }

    /// Whether the node is a member of the list.
    pub(crate) fn is_linked(&self) -> bool {
        self.linked
    }
}

impl<I> Default for Link<I> {
    fn default() -> Self {
        Self::new()
    }
}

/// Accessor from arena and node index to the node's link.
pub(crate) type LinkOf<A, I> = for<'a> fn(&'a mut A, I) -> &'a mut Link<I>;

/// A list threaded through the nodes of arena `A`.
pub(crate) struct List<A, I> {
    head: Option<I>,
    tail: Option<I>,
    len: usize,
    link: LinkOf<A, I>,
}

impl<A, I: Copy + PartialEq> List<A, I> {
    pub(crate) fn new(link: LinkOf<A, I>) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            link,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn first(&self) -> Option<I> {
        self.head
    }

    pub(crate) fn last(&self) -> Option<I> {
        self.tail
    }

    /// Whether `item` is a member of this list.
    pub(crate) fn contains(&self, arena: &mut A, item: I) -> bool {
        (self.link)(arena, item).is_linked()
    }

    /// Append `item`. Does nothing if it is already a member.
    pub(crate) fn push_back(&mut self, arena: &mut A, item: I) {
        let tail = self.tail;
        {
            let link = (self.link)(arena, item);
            if link.linked {
                return;
            }
            *link = Link {
                prev: tail,
                next: None,
                linked: true,
            };
        }
        match tail {
            Some(tail) => (self.link)(arena, tail).next = Some(item),
            None => self.head = Some(item),
        }
        self.tail = Some(item);
        self.len += 1;
    }

    /// Unlink `item`. Returns false if it was not a member.
    pub(crate) fn remove(&mut self, arena: &mut A, item: I) -> bool {
        let (prev, next) = {
            let link = (self.link)(arena, item);
            if !link.linked {
                return false;
            }
            let neighbours = (link.prev, link.next);
            *link = Link::new();
            neighbours
        };
        match prev {
            Some(prev) => (self.link)(arena, prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => (self.link)(arena, next).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        true
    }

    /// Successor of `item`.
    pub(crate) fn next(&self, arena: &mut A, item: I) -> Option<I> {
        (self.link)(arena, item).next
    }

    /// Members from first to last.
    pub(crate) fn to_vec(&self, arena: &mut A) -> Vec<I> {
        let mut items = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(item) = cursor {
            items.push(item);
            cursor = self.next(arena, item);
        }
        items
    }

    /// Forget all members without touching their links.
    ///
    /// Only valid when the arena is discarded as well.
    pub(crate) fn reset(&mut self) {
        self.head = None;
        self.tail = None;
        self.len = 0;
    }
}
