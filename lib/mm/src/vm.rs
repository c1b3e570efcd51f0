pub mod addr_space;
pub mod page_table;
pub mod pte;
pub mod vm_area;
