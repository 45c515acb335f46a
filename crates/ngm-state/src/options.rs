//! Option structs parameterizing every storage operation.

/// Options for create calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Replace an existing record instead of failing.
    pub over_write_if_exist: bool,
}

/// Options for update calls.
///
/// Updates are merge-patches: zero, empty and `false` fields of the update
/// leave the stored value untouched unless `overwrite_zero_or_empty_str`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub create_if_not_exist: bool,
    pub overwrite_zero_or_empty_str: bool,
}

impl UpdateOptions {
    /// Replace the whole record, zero values included.
    pub fn overwrite() -> Self {
        Self {
            create_if_not_exist: false,
            overwrite_zero_or_empty_str: true,
        }
    }

    /// Replace the whole record, creating it when absent.
    pub fn upsert() -> Self {
        Self {
            create_if_not_exist: true,
            overwrite_zero_or_empty_str: true,
        }
    }
}

/// Options for get calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub err_if_not_exist: bool,
    pub get_soft_deleted: bool,
}

/// Options for list calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Maximum items returned; 0 means unlimited.
    pub limit: usize,
    /// Zero-based page, used with `do_pagination`.
    pub page: usize,
    pub return_soft_deleted_items: bool,
    pub do_pagination: bool,
}

impl ListOptions {
    /// Apply pagination and limit to an already-filtered list.
    pub fn window<T>(&self, items: Vec<T>) -> Vec<T> {
        if self.limit == 0 {
            return items;
        }
        let skip = if self.do_pagination {
            self.page.saturating_mul(self.limit)
        } else {
            0
        };
        items.into_iter().skip(skip).take(self.limit).collect()
    }
}

/// Options for delete calls. All deletes are soft.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    pub err_if_not_exist: bool,
}
